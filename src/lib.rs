//! OpenAI-compatible gateway that starts and stops local llama.cpp model
//! servers on demand, queues requests while a model is booting, and
//! reverse-proxies everything else straight through.

pub mod config;
pub mod errors;
pub mod forwarder;
pub mod http_api;
pub mod model_instance;
pub mod model_manager;
pub mod process_utils;
pub mod queue_manager;

use std::sync::Arc;

use crate::forwarder::Forwarder;
use crate::model_manager::ModelManager;
use crate::queue_manager::QueueManager;

/// Shared state handed to every axum handler via the `State` extractor.
#[derive(Clone)]
pub struct GatewayState {
    pub model_manager: Arc<ModelManager>,
    pub queue_manager: Arc<QueueManager>,
    pub forwarder: Arc<Forwarder>,
}
