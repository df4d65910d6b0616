//! Model gatekeeper — an OpenAI-compatible gateway that starts and stops
//! local llama.cpp model servers on demand.
//!
//! Each managed model is backed by an independent `llama-server` process
//! communicating over its own OpenAI-compatible HTTP API on a per-model
//! port; this process queues requests while a model is booting and
//! reverse-proxies everything else straight through.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use model_gatekeeper::config::{self, GatewayConfig};
use model_gatekeeper::forwarder::Forwarder;
use model_gatekeeper::model_manager::{self, ModelManager};
use model_gatekeeper::queue_manager::{self, QueueManager};
use model_gatekeeper::{http_api, GatewayState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .init();

    info!("model gatekeeper starting...");

    let gateway_config = GatewayConfig::from_env();
    let models_path = std::env::var("GATEWAY_MODELS_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("models.yaml"));

    let model_configs = config::load_model_configs(&models_path)
        .with_context(|| format!("loading model configs from {}", models_path.display()))?;
    info!(count = model_configs.len(), path = %models_path.display(), "loaded model configs");

    let queue_manager = Arc::new(QueueManager::new());
    for name in model_configs.keys() {
        queue_manager.ensure_queue_default(name).await;
    }

    let model_manager = Arc::new(ModelManager::new(queue_manager.clone(), &gateway_config));
    model_manager.load_configs(model_configs).await;

    let eviction_handle = tokio::spawn(model_manager::run_eviction_loop(model_manager.clone()));
    let cleanup_handle = tokio::spawn(queue_manager::run_cleanup_loop(queue_manager.clone()));

    model_manager.preload().await;
    model_manager.start_all_auto().await;

    let state = GatewayState {
        model_manager: model_manager.clone(),
        queue_manager: queue_manager.clone(),
        forwarder: Arc::new(Forwarder::new()),
    };

    let app = http_api::router(state).layer(
        tower_http::trace::TraceLayer::new_for_http(),
    ).layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", gateway_config.host, gateway_config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "gateway listening");

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received SIGINT, shutting down..."),
            Err(e) => error!("failed to listen for SIGINT: {e}"),
        }

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("received SIGTERM, shutting down...");
                    }
                    () = std::future::pending::<()>() => {}
                }
            }
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server failed")?;

    eviction_handle.abort();
    cleanup_handle.abort();
    model_manager.shutdown().await;

    info!("model gatekeeper shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_models_file_name_is_models_yaml() {
        let default = PathBuf::from("models.yaml");
        assert_eq!(default.file_name().unwrap(), "models.yaml");
    }
}
