//! The HTTP façade: every route in the gateway's public surface, wired onto
//! [`GatewayState`] the way `agent-core/src/management.rs` wires its axum
//! `Router` onto shared `Arc<Mutex<...>>` state.
//!
//! Proxy routes (`/v1/*`) delegate to [`crate::forwarder::Forwarder`];
//! admin routes talk to [`crate::model_manager::ModelManager`] and
//! [`crate::queue_manager::QueueManager`] directly and never touch an
//! upstream model.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::errors::GatewayError;
use crate::forwarder::IncomingRequest;
use crate::GatewayState;

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/admin/models/start-all", post(start_all))
        .route("/admin/models/stop-all", post(stop_all))
        .route("/admin/models/restart-all", post(restart_all))
        .route("/admin/models/:name/start", post(start_model))
        .route("/admin/models/:name/stop", post(stop_model))
        .route("/admin/models/:name/status", get(model_status))
        .route("/admin/models/:name/reload", post(reload_model))
        .route("/admin/groups", get(group_status_all))
        .route("/admin/groups/:group/start", post(start_group))
        .route("/admin/groups/:group/stop", post(stop_group))
        .route("/admin/queue/status", get(queue_status_all))
        .route("/admin/queue/:name/status", get(queue_status))
        .route("/admin/queue/:name/clear", post(queue_clear))
        .with_state(state)
}

fn into_incoming(headers: axum::http::HeaderMap, method: axum::http::Method, query: String, body: axum::body::Bytes) -> IncomingRequest {
    IncomingRequest { method, headers, query, body }
}

async fn proxy_request(
    state: &GatewayState,
    endpoint: &str,
    method: axum::http::Method,
    headers: axum::http::HeaderMap,
    query: String,
    body: axum::body::Bytes,
) -> Response {
    let Some(model_name) = crate::forwarder::extract_model(&body) else {
        return GatewayError::InvalidRequest("request body must include a \"model\" field".into())
            .into_response();
    };

    if state.model_manager.get_model_status(&model_name).await.is_none() {
        return GatewayError::UnconfiguredModel(format!(
            "model '{model_name}' not found"
        ))
        .into_response();
    }

    let req = into_incoming(headers, method, query, body);
    state
        .forwarder
        .handle(req, endpoint, &model_name, &state.model_manager, &state.queue_manager)
        .await
}

async fn chat_completions(
    State(state): State<GatewayState>,
    method: axum::http::Method,
    headers: axum::http::HeaderMap,
    raw_query: axum::extract::RawQuery,
    body: axum::body::Bytes,
) -> Response {
    let query = raw_query.0.unwrap_or_default();
    proxy_request(&state, "/v1/chat/completions", method, headers, query, body).await
}

async fn completions(
    State(state): State<GatewayState>,
    method: axum::http::Method,
    headers: axum::http::HeaderMap,
    raw_query: axum::extract::RawQuery,
    body: axum::body::Bytes,
) -> Response {
    let query = raw_query.0.unwrap_or_default();
    proxy_request(&state, "/v1/completions", method, headers, query, body).await
}

async fn list_models(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let statuses = state.model_manager.get_all_model_status().await;
    let data: Vec<serde_json::Value> = statuses
        .into_iter()
        .map(|(name, status)| {
            let availability = if status.status == "running" {
                "available"
            } else {
                "unavailable"
            };
            json!({
                "id": name,
                "object": "model",
                "created": 0,
                "owned_by": "llama-cpp",
                "permission": [],
                "root": name,
                "parent": serde_json::Value::Null,
                "status": availability,
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

async fn health(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let statuses = state.model_manager.get_all_model_status().await;
    let total = statuses.len();
    let active = statuses.values().filter(|s| s.status == "running").count();
    let memory = crate::process_utils::system_memory();

    Json(json!({
        "status": "healthy",
        "models": {
            "total": total,
            "active": active,
            "details": statuses,
        },
        "system": {
            "memory": {
                "total": memory.total_gb,
                "available": memory.available_gb,
                "used": memory.used_gb,
                "percent": memory.percent,
            }
        }
    }))
}

async fn metrics(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let all = state.queue_manager.all_stats().await;
    Json(json!({ "models": all }))
}

#[derive(Deserialize)]
struct ReloadBody {
    #[serde(default)]
    model_path: Option<String>,
}

async fn start_model(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    match state.model_manager.get_or_start(&name).await {
        Some(_) => Ok(Json(json!({ "model": name, "status": "started" }))),
        None => Err(GatewayError::StartFailed(format!(
            "failed to start model '{name}'"
        ))),
    }
}

async fn stop_model(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    let ok = state.model_manager.stop(&name).await;
    Json(json!({ "model": name, "stopped": ok }))
}

async fn model_status(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Result<Json<crate::model_manager::ModelStatus>, GatewayError> {
    state
        .model_manager
        .get_model_status(&name)
        .await
        .map(Json)
        .ok_or_else(|| GatewayError::ModelNotFound(name))
}

async fn reload_model(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    body: Option<Json<ReloadBody>>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let new_config = body.and_then(|Json(b)| b.model_path).map(|path| {
        let mut cfg = crate::config::ModelConfig {
            name: name.clone(),
            port: 0,
            model_path: path,
            context_length: 4096,
            gpu_layers: -1,
            chat_format: "chatml".to_string(),
            auto_start: false,
            preload: false,
            priority: 5,
            resource_group: "default".to_string(),
            additional_args: vec![],
        };
        cfg.name = name.clone();
        cfg
    });
    let outcome = state.model_manager.reload(&name, new_config).await;
    if outcome.success {
        Ok(Json(json!({ "success": true, "message": outcome.message })))
    } else {
        Err(GatewayError::ReloadFailed(outcome.message))
    }
}

async fn start_all(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!(state.model_manager.start_all().await))
}

async fn stop_all(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!(state.model_manager.stop_all().await))
}

async fn restart_all(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!(state.model_manager.restart_all().await))
}

async fn start_group(
    State(state): State<GatewayState>,
    Path(group): Path<String>,
) -> Json<serde_json::Value> {
    Json(json!(state.model_manager.start_resource_group(&group).await))
}

async fn stop_group(
    State(state): State<GatewayState>,
    Path(group): Path<String>,
) -> Json<serde_json::Value> {
    Json(json!(state.model_manager.stop_resource_group(&group).await))
}

async fn group_status_all(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(state.model_manager.get_resource_group_status(None).await)
}

async fn queue_status_all(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!(state.queue_manager.all_stats().await))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn queue_status(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Json<serde_json::Value> {
    let stats = state.queue_manager.stats(&name).await;
    let history = state.queue_manager.history(&name, q.limit).await;
    Json(json!({ "stats": stats, "history": history }))
}

async fn queue_clear(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    state.queue_manager.clear(&name).await;
    Json(json!({ "model": name, "cleared": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> GatewayState {
        let queue_manager = Arc::new(crate::queue_manager::QueueManager::new());
        let gateway_config = crate::config::GatewayConfig::default();
        let model_manager = Arc::new(crate::model_manager::ModelManager::new(
            queue_manager.clone(),
            &gateway_config,
        ));
        GatewayState {
            model_manager,
            queue_manager,
            forwarder: Arc::new(crate::forwarder::Forwarder::new()),
        }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_completions_rejects_body_without_model_field() {
        let app = router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_completions_400s_for_unconfigured_model() {
        let app = router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"model":"ghost"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stop_unconfigured_model_is_still_a_successful_noop() {
        let app = router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/admin/models/ghost/stop")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn model_status_404s_for_unconfigured_model() {
        let app = router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/admin/models/ghost/status")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
