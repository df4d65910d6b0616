//! A single managed model process: owns the child handle, tracks readiness
//! and access time, and exposes the start/stop/health-check operations.
//!
//! Grounded on `examples/original_source/src/model_manager.py`'s
//! `ModelInstance` dataclass, restructured around `tokio::process::Child`
//! the way `runtime/src/model_manager.rs`'s `ManagedModel` already does.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tracing::{error, info, warn};

use crate::config::ModelConfig;
use crate::process_utils::{self, build_command};
use crate::queue_manager::{ModelState, QueueManager};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const START_TIMEOUT: Duration = Duration::from_secs(60);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// One running (or starting) model.
pub struct ModelInstance {
    pub config: ModelConfig,
    process: Option<Child>,
    pub is_ready: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub request_count: u64,
    http_client: reqwest::Client,
}

impl ModelInstance {
    pub fn new(config: ModelConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            process: None,
            is_ready: false,
            start_time: None,
            last_accessed: None,
            request_count: 0,
            http_client,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.config.port)
    }

    fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }

    fn child_alive(&mut self) -> bool {
        match &mut self.process {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Start the backing process. See spec §4.B for the exact state
    /// sequence this follows.
    pub async fn start(&mut self, queue_mgr: &QueueManager) -> bool {
        queue_mgr
            .set_state(&self.config.name, ModelState::Starting)
            .await;

        if self.child_alive() {
            warn!(model = %self.config.name, "start() called while already running");
            queue_mgr
                .set_state(&self.config.name, ModelState::Running)
                .await;
            return true;
        }

        if process_utils::port_listening("127.0.0.1", self.config.port).await {
            error!(model = %self.config.name, port = self.config.port, "port already occupied by another process");
            queue_mgr
                .set_state(&self.config.name, ModelState::Stopped)
                .await;
            return false;
        }

        info!(
            model = %self.config.name,
            argv = ?build_command(&self.config),
            "spawning llama-server"
        );

        let child = match process_utils::spawn_model_process(&self.config) {
            Ok(child) => child,
            Err(e) => {
                error!(model = %self.config.name, "failed to spawn llama-server: {e}");
                queue_mgr
                    .set_state(&self.config.name, ModelState::Stopped)
                    .await;
                return false;
            }
        };
        self.process = Some(child);
        self.start_time = Some(process_utils::now());

        let ready = process_utils::wait_for_ready(&self.http_client, &self.base_url(), START_TIMEOUT)
            .await
            && self.child_alive();

        if ready {
            self.is_ready = true;
            self.touch();
            queue_mgr
                .set_state(&self.config.name, ModelState::Running)
                .await;
            info!(model = %self.config.name, port = self.config.port, "model is ready");
            true
        } else {
            error!(model = %self.config.name, "model failed to become ready within timeout");
            self.stop(queue_mgr).await;
            queue_mgr
                .set_state(&self.config.name, ModelState::Stopped)
                .await;
            false
        }
    }

    /// Stop the backing process. Idempotent and best-effort: a failed
    /// graceful stop still results in a kill and a `true` return so the
    /// manager can remove the instance from its map.
    pub async fn stop(&mut self, queue_mgr: &QueueManager) -> bool {
        queue_mgr
            .set_state(&self.config.name, ModelState::Stopping)
            .await;

        let Some(mut child) = self.process.take() else {
            queue_mgr
                .set_state(&self.config.name, ModelState::Stopped)
                .await;
            return true;
        };

        info!(model = %self.config.name, "stopping model");
        let graceful = process_utils::graceful_stop(&mut child, GRACEFUL_STOP_TIMEOUT).await;
        if !graceful {
            warn!(model = %self.config.name, "model was force killed");
        }

        self.is_ready = false;
        queue_mgr
            .set_state(&self.config.name, ModelState::Stopped)
            .await;
        true
    }

    /// `false` if there is no process or it has exited; otherwise performs
    /// a bounded `GET /health` and updates `is_ready` to match.
    pub async fn health_check(&mut self) -> bool {
        if !self.child_alive() {
            self.is_ready = false;
            return false;
        }

        let healthy = match tokio::time::timeout(
            HEALTH_CHECK_TIMEOUT,
            self.http_client.get(self.health_url()).send(),
        )
        .await
        {
            Ok(Ok(resp)) => resp.status().is_success(),
            _ => false,
        };
        self.is_ready = healthy;
        healthy
    }

    pub fn touch(&mut self) {
        self.last_accessed = Some(process_utils::now());
        self.request_count += 1;
    }

    pub fn memory_mb(&self) -> Option<f64> {
        self.process.as_ref().and_then(|c| c.id()).and_then(process_utils::rss_mb)
    }

    pub fn cpu_percent(&self) -> Option<f32> {
        self.process.as_ref().and_then(|c| c.id()).and_then(process_utils::cpu_percent)
    }

    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.start_time.map(|start| Utc::now().signed_duration_since(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(port: u16) -> ModelConfig {
        ModelConfig {
            name: "m1".into(),
            port,
            model_path: "/models/a.gguf".into(),
            context_length: 2048,
            gpu_layers: -1,
            chat_format: "chatml".into(),
            auto_start: false,
            preload: false,
            priority: 5,
            resource_group: "default".into(),
            additional_args: vec![],
        }
    }

    #[test]
    fn base_url_and_health_url_are_derived_from_port() {
        let instance = ModelInstance::new(sample_config(11777), reqwest::Client::new());
        assert_eq!(instance.base_url(), "http://127.0.0.1:11777");
        assert_eq!(instance.health_url(), "http://127.0.0.1:11777/health");
    }

    #[test]
    fn touch_increments_request_count() {
        let mut instance = ModelInstance::new(sample_config(11778), reqwest::Client::new());
        assert_eq!(instance.request_count, 0);
        instance.touch();
        instance.touch();
        assert_eq!(instance.request_count, 2);
        assert!(instance.last_accessed.is_some());
    }

    #[tokio::test]
    async fn start_fails_when_port_already_occupied() {
        // Bind the port ourselves so `port_listening` sees it as occupied.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept in the background so the connect from port_listening succeeds.
        std::thread::spawn(move || {
            let _ = listener.accept();
        });

        let qm = QueueManager::new();
        let mut instance = ModelInstance::new(sample_config(port), reqwest::Client::new());
        let started = instance.start(&qm).await;
        assert!(!started);
        assert_eq!(qm.get_state("m1").await, ModelState::Stopped);
    }

    #[tokio::test]
    async fn health_check_false_without_process() {
        let mut instance = ModelInstance::new(sample_config(11779), reqwest::Client::new());
        assert!(!instance.health_check().await);
    }
}
