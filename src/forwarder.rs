//! Reverse-proxy forwarding: model-name extraction, queueing decision, and
//! byte-for-byte forwarding to the selected instance (streaming or
//! buffered).
//!
//! Grounded on
//! `examples/original_source/src/llm_proxifier/proxy_handler.py`
//! (`ProxyHandler.extract_model_from_request`, `handle_chat_completions`,
//! `forward_request`, `_handle_streaming_response`), using `reqwest` +
//! `axum` streaming bodies the way the teacher's `runtime/src/inference.rs`
//! talks to llama-server's OpenAI-compatible HTTP API.

use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tracing::{error, warn};

use crate::errors::GatewayError;
use crate::model_manager::ModelManager;
use crate::queue_manager::QueueManager;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parses the JSON body and returns the `model` field. `None` on malformed
/// JSON, a missing field, or a non-object body.
pub fn extract_model(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(|s| s.to_string())
}

pub struct IncomingRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: String,
    pub body: Bytes,
}

pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(FORWARD_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    /// The full `/v1/*` handling path: queue while the model is starting or
    /// reloading, otherwise get-or-start the backend and forward.
    pub async fn handle(
        &self,
        req: IncomingRequest,
        endpoint: &str,
        model_name: &str,
        model_manager: &ModelManager,
        queue_manager: &QueueManager,
    ) -> Response {
        if queue_manager.should_queue(model_name).await {
            return self.queue_or_reject(model_name, endpoint, queue_manager).await;
        }

        match model_manager.get_or_start(model_name).await {
            Some(instance) => {
                self.forward(req, &instance.base_url, endpoint, model_name, queue_manager)
                    .await
            }
            None => GatewayError::ServiceUnavailable(format!(
                "Model {model_name} is not available"
            ))
            .into_response(),
        }
    }

    async fn queue_or_reject(
        &self,
        model_name: &str,
        endpoint: &str,
        queue_manager: &QueueManager,
    ) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let client_id = uuid::Uuid::new_v4().to_string();

        let accepted = queue_manager
            .enqueue(
                model_name,
                request_id.clone(),
                client_id,
                endpoint.to_string(),
                DEFAULT_QUEUE_TIMEOUT,
            )
            .await;

        if !accepted {
            warn!(model = %model_name, "queue full, rejecting request");
            let mut response = GatewayError::ServiceUnavailable(
                "queue is full".to_string(),
            )
            .into_response();
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from_static("60"));
            return response;
        }

        let stats = queue_manager.stats(model_name).await;
        let state = stats.state.to_string();
        let position = stats.queue_size;

        let body = serde_json::json!({
            "message": "Request queued",
            "request_id": request_id,
            "position": position,
            "model_state": state,
        });

        let mut response = (StatusCode::ACCEPTED, axum::Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert("Retry-After", HeaderValue::from_static("30"));
        headers.insert(
            "X-Queue-Position",
            HeaderValue::from_str(&position.to_string()).unwrap(),
        );
        headers.insert(
            "X-Queue-Model-State",
            HeaderValue::from_str(&state).unwrap(),
        );
        response
    }

    /// Forward `req` to `base_url{endpoint}`, streaming SSE pass-through
    /// when the caller asked for it or upstream responds with one.
    pub async fn forward(
        &self,
        req: IncomingRequest,
        base_url: &str,
        endpoint: &str,
        model_name: &str,
        queue_manager: &QueueManager,
    ) -> Response {
        let start = Instant::now();
        let url = format!("{base_url}{endpoint}");
        let wants_stream = req.query.contains("stream=true");

        let mut outbound_headers = reqwest::header::HeaderMap::new();
        for (name, value) in req.headers.iter() {
            if is_hop_header(name) {
                continue;
            }
            if let Ok(v) = reqwest::header::HeaderValue::from_bytes(value.as_bytes()) {
                if let Ok(n) = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()) {
                    outbound_headers.insert(n, v);
                }
            }
        }

        let mut builder = self
            .client
            .request(req.method.clone(), &url)
            .headers(outbound_headers)
            .body(req.body);
        if !req.query.is_empty() {
            builder = builder.query(&parse_query(&req.query));
        }

        let result = builder.send().await;
        let processing_time = start.elapsed().as_secs_f64();

        let response = match result {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                error!(model = %model_name, "upstream timeout forwarding to {url}");
                queue_manager.track(model_name, 0.0, processing_time, false).await;
                return GatewayError::Timeout("gateway timeout".to_string()).into_response();
            }
            Err(e) => {
                error!(model = %model_name, "upstream error forwarding to {url}: {e}");
                queue_manager.track(model_name, 0.0, processing_time, false).await;
                return GatewayError::BadGateway(format!("bad gateway: {e}")).into_response();
            }
        };

        let status = response.status();
        let success = status.as_u16() >= 200 && status.as_u16() < 400;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let result = if content_type.contains("text/event-stream") || wants_stream {
            self.stream_response(response).await
        } else {
            self.buffered_response(response, model_name, queue_manager).await
        };

        queue_manager.track(model_name, 0.0, processing_time, success).await;
        result
    }

    async fn stream_response(&self, response: reqwest::Response) -> Response {
        let byte_stream = response.bytes_stream();
        let line_stream = byte_stream_to_lines(byte_stream);
        let body = Body::from_stream(line_stream);

        let mut builder = axum::response::Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Headers", "*")
            .header("Access-Control-Allow-Methods", "*");
        builder = builder.header("X-Content-Type-Options", "nosniff");
        builder.body(body).unwrap_or_else(|_| {
            GatewayError::Internal("failed to build streaming response".to_string())
                .into_response()
        })
    }

    async fn buffered_response(
        &self,
        response: reqwest::Response,
        model_name: &str,
        queue_manager: &QueueManager,
    ) -> Response {
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let headers = response.headers().clone();
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                error!(model = %model_name, "error reading upstream body: {e}");
                return GatewayError::BadGateway(format!("bad gateway: {e}")).into_response();
            }
        };

        let json_value: Option<serde_json::Value> = serde_json::from_slice(&bytes).ok();
        let body = match json_value {
            Some(v) => v,
            None => serde_json::json!({ "text": String::from_utf8_lossy(&bytes) }),
        };

        let stats = queue_manager.stats(model_name).await;
        let mut resp = (status, axum::Json(body)).into_response();
        let out_headers = resp.headers_mut();
        for (name, value) in headers.iter() {
            if is_hop_header_reqwest(name) {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                out_headers.insert(n, v);
            }
        }
        if stats.queue_size > 0 {
            out_headers.insert(
                "X-Queue-Position",
                HeaderValue::from_str(&stats.queue_size.to_string()).unwrap(),
            );
            out_headers.insert(
                "X-Queue-Model-State",
                HeaderValue::from_str(&stats.state.to_string()).unwrap(),
            );
        }
        resp
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

fn is_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str().to_ascii_lowercase().as_str(),
        "host" | "content-length" | "connection"
    )
}

fn is_hop_header_reqwest(name: &reqwest::header::HeaderName) -> bool {
    matches!(
        name.as_str().to_ascii_lowercase().as_str(),
        "host" | "content-length" | "connection" | "transfer-encoding"
    )
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").to_string();
            Some((key, value))
        })
        .collect()
}

/// Re-chunk an upstream byte stream into newline-terminated SSE lines, the
/// way `proxy_handler.py`'s `_handle_streaming_response` iterates
/// `response.aiter_lines()`.
fn byte_stream_to_lines(
    stream: impl futures_util::Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let mut buffer: Vec<u8> = Vec::new();
    stream.flat_map(move |chunk| {
        let mut out: Vec<Result<Bytes, std::io::Error>> = Vec::new();
        match chunk {
            Ok(bytes) => {
                buffer.extend_from_slice(&bytes);
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    out.push(Ok(Bytes::from(line)));
                }
            }
            Err(e) => {
                let msg = serde_json::json!({
                    "error": { "message": e.to_string(), "type": "stream_error", "code": 500 }
                });
                out.push(Ok(Bytes::from(format!("data: {msg}\n\n"))));
            }
        }
        futures_util::stream::iter(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_model_reads_model_field() {
        let body = br#"{"model":"m1","messages":[]}"#;
        assert_eq!(extract_model(body), Some("m1".to_string()));
    }

    #[test]
    fn extract_model_none_on_missing_field() {
        let body = br#"{"messages":[]}"#;
        assert_eq!(extract_model(body), None);
    }

    #[test]
    fn extract_model_none_on_malformed_json() {
        let body = b"not json";
        assert_eq!(extract_model(body), None);
    }

    #[test]
    fn extract_model_none_on_non_object_body() {
        let body = b"[1,2,3]";
        assert_eq!(extract_model(body), None);
    }

    #[test]
    fn parse_query_splits_pairs() {
        let pairs = parse_query("stream=true&foo=bar");
        assert_eq!(
            pairs,
            vec![
                ("stream".to_string(), "true".to_string()),
                ("foo".to_string(), "bar".to_string()),
            ]
        );
    }

    #[test]
    fn is_hop_header_scrubs_host_content_length_connection() {
        assert!(is_hop_header(&HeaderName::from_static("host")));
        assert!(is_hop_header(&HeaderName::from_static("content-length")));
        assert!(is_hop_header(&HeaderName::from_static("connection")));
        assert!(!is_hop_header(&HeaderName::from_static("authorization")));
    }
}
