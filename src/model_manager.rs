//! The scheduler: coordinates start/stop across model instances under a
//! single manager-wide lock, enforces the concurrency cap, priority, and
//! resource groups, and runs the idle-eviction loop.
//!
//! Grounded on `examples/original_source/src/model_manager.py`'s
//! `ModelManager` class, restructured in the teacher's
//! `Arc<Mutex<...>>` + `tokio::spawn` idiom (`runtime/src/main.rs`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{GatewayConfig, ModelConfig};
use crate::model_instance::ModelInstance;
use crate::queue_manager::{ModelState, QueueManager};

pub struct ReloadOutcome {
    pub success: bool,
    pub message: String,
}

struct Inner {
    configs: HashMap<String, ModelConfig>,
    models: HashMap<String, ModelInstance>,
}

/// Central orchestrator. Holds a reference to the Queue Manager and owns
/// the `configs`/`models` maps behind one mutex so starts/stops across
/// different model names are serialised, while forwarding to an already
/// running instance happens outside this lock entirely.
pub struct ModelManager {
    inner: Mutex<Inner>,
    queue_manager: Arc<QueueManager>,
    http_client: reqwest::Client,
    pub idle_timeout: chrono::Duration,
    pub max_concurrent: usize,
}

impl ModelManager {
    pub fn new(queue_manager: Arc<QueueManager>, gateway_config: &GatewayConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                configs: HashMap::new(),
                models: HashMap::new(),
            }),
            queue_manager,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .expect("reqwest client"),
            idle_timeout: chrono::Duration::minutes(gateway_config.timeout_minutes as i64),
            max_concurrent: gateway_config.max_concurrent_models,
        }
    }

    pub async fn load_configs(&self, configs: HashMap<String, ModelConfig>) {
        let mut guard = self.inner.lock().await;
        guard.configs = configs;
        info!(count = guard.configs.len(), "loaded model configurations");
    }

    /// Return a ready instance for `name`, starting it if necessary. `None`
    /// covers: unconfigured name, concurrency cap hit, or a failed start.
    pub async fn get_or_start(&self, name: &str) -> Option<ModelSnapshot> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let config = inner.configs.get(name)?.clone();

        if let Some(instance) = inner.models.get_mut(name) {
            if instance.is_ready && instance.health_check().await {
                instance.touch();
                return Some(ModelSnapshot::from(&*instance));
            }
            let mut stale = inner.models.remove(name).unwrap();
            stale.stop(&self.queue_manager).await;
        }

        let active = inner.models.values().filter(|m| m.is_ready).count();
        if active >= self.max_concurrent {
            warn!(
                model = %name,
                active,
                max = self.max_concurrent,
                "concurrent-model cap reached"
            );
            return None;
        }

        let mut instance = ModelInstance::new(config, self.http_client.clone());
        if instance.start(&self.queue_manager).await {
            let snapshot = ModelSnapshot::from(&instance);
            inner.models.insert(name.to_string(), instance);
            Some(snapshot)
        } else {
            None
        }
    }

    /// Idempotent: stopping an unknown name is a no-op success.
    pub async fn stop(&self, name: &str) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.models.remove(name) {
            Some(mut instance) => instance.stop(&self.queue_manager).await,
            None => true,
        }
    }

    pub async fn stop_all(&self) -> HashMap<String, bool> {
        let mut guard = self.inner.lock().await;
        let names: Vec<String> = guard.models.keys().cloned().collect();
        let mut results = HashMap::new();
        for name in names {
            let instance = guard.models.get(&name).unwrap();
            if instance.config.preload {
                warn!(model = %name, "skipping preloaded model in stop_all");
                results.insert(name, false);
                continue;
            }
            let mut instance = guard.models.remove(&name).unwrap();
            let ok = instance.stop(&self.queue_manager).await;
            results.insert(name, ok);
        }
        results
    }

    pub async fn start_all(&self) -> HashMap<String, bool> {
        let names = self.models_by_priority().await;
        let mut results = HashMap::new();
        for name in names {
            results.insert(name.clone(), self.get_or_start(&name).await.is_some());
        }
        results
    }

    pub async fn restart_all(&self) -> HashMap<String, bool> {
        let running: Vec<String> = {
            let guard = self.inner.lock().await;
            guard.models.keys().cloned().collect()
        };
        let mut results = HashMap::new();
        for name in running {
            self.stop(&name).await;
            results.insert(name.clone(), self.get_or_start(&name).await.is_some());
        }
        results
    }

    pub async fn start_all_auto(&self) {
        let auto_start_names: Vec<String> = {
            let guard = self.inner.lock().await;
            let mut configs: Vec<&ModelConfig> =
                guard.configs.values().filter(|c| c.auto_start).collect();
            configs.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
            configs.into_iter().map(|c| c.name.clone()).collect()
        };
        info!(count = auto_start_names.len(), "starting auto-start models");
        for name in auto_start_names {
            if self.get_or_start(&name).await.is_none() {
                error!(model = %name, "failed to auto-start model");
            }
        }
    }

    pub async fn preload(&self) {
        let preload_names: Vec<String> = {
            let guard = self.inner.lock().await;
            guard
                .configs
                .values()
                .filter(|c| c.preload)
                .map(|c| c.name.clone())
                .collect()
        };
        for name in preload_names {
            if self.get_or_start(&name).await.is_none() {
                error!(model = %name, "failed to preload model");
            }
        }
    }

    pub async fn start_resource_group(&self, group: &str) -> HashMap<String, bool> {
        let mut names = self.models_in_group(group).await;
        names.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let mut results = HashMap::new();
        for (name, _priority) in names {
            results.insert(name.clone(), self.get_or_start(&name).await.is_some());
        }
        results
    }

    pub async fn stop_resource_group(&self, group: &str) -> HashMap<String, bool> {
        let names = self.models_in_group(group).await;
        let mut results = HashMap::new();
        for (name, _priority) in names {
            let is_preload = {
                let guard = self.inner.lock().await;
                guard.configs.get(&name).map(|c| c.preload).unwrap_or(false)
            };
            if is_preload {
                warn!(model = %name, group, "skipping preloaded model in stop_resource_group");
                results.insert(name, false);
                continue;
            }
            results.insert(name.clone(), self.stop(&name).await);
        }
        results
    }

    async fn models_in_group(&self, group: &str) -> Vec<(String, u8)> {
        let guard = self.inner.lock().await;
        guard
            .configs
            .values()
            .filter(|c| c.resource_group == group)
            .map(|c| (c.name.clone(), c.priority))
            .collect()
    }

    pub async fn get_resource_group_status(&self, group: Option<&str>) -> serde_json::Value {
        let guard = self.inner.lock().await;
        let mut groups: HashMap<String, Vec<&ModelConfig>> = HashMap::new();
        for cfg in guard.configs.values() {
            if let Some(g) = group {
                if cfg.resource_group != g {
                    continue;
                }
            }
            groups.entry(cfg.resource_group.clone()).or_default().push(cfg);
        }

        let mut out = serde_json::Map::new();
        for (name, configs) in groups {
            let running = configs
                .iter()
                .filter(|c| guard.models.get(&c.name).map(|m| m.is_ready).unwrap_or(false))
                .count();
            out.insert(
                name,
                serde_json::json!({
                    "total_models": configs.len(),
                    "running_models": running,
                    "models": configs.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
                }),
            );
        }
        serde_json::Value::Object(out)
    }

    /// The only transition that passes through RELOADING.
    pub async fn reload(&self, name: &str, new_config: Option<ModelConfig>) -> ReloadOutcome {
        let mut guard = self.inner.lock().await;

        if !guard.configs.contains_key(name) && new_config.is_none() {
            return ReloadOutcome {
                success: false,
                message: format!("model {name} not configured"),
            };
        }

        self.queue_manager.set_state(name, ModelState::Reloading).await;
        self.queue_manager.clear(name).await;

        let was_running = guard
            .models
            .get(name)
            .map(|m| m.is_ready)
            .unwrap_or(false);

        if let Some(mut instance) = guard.models.remove(name) {
            instance.stop(&self.queue_manager).await;
        }

        if let Some(cfg) = new_config {
            guard.configs.insert(name.to_string(), cfg);
        }

        if was_running {
            let config = guard.configs.get(name).unwrap().clone();
            let mut instance = ModelInstance::new(config, self.http_client.clone());
            if instance.start(&self.queue_manager).await {
                guard.models.insert(name.to_string(), instance);
                ReloadOutcome {
                    success: true,
                    message: format!("model {name} reloaded successfully"),
                }
            } else {
                self.queue_manager.set_state(name, ModelState::Stopped).await;
                ReloadOutcome {
                    success: false,
                    message: format!("failed to start model {name} after reload"),
                }
            }
        } else {
            self.queue_manager.set_state(name, ModelState::Stopped).await;
            ReloadOutcome {
                success: true,
                message: format!("model {name} configuration updated (not running)"),
            }
        }
    }

    pub async fn get_model_status(&self, name: &str) -> Option<ModelStatus> {
        let guard = self.inner.lock().await;
        let config = guard.configs.get(name)?;
        Some(match guard.models.get(name) {
            Some(instance) => ModelStatus {
                status: if instance.is_ready { "running" } else { "starting" }.to_string(),
                port: Some(config.port),
                priority: config.priority,
                resource_group: config.resource_group.clone(),
                preload: config.preload,
                auto_start: config.auto_start,
                last_accessed: instance.last_accessed,
                uptime_seconds: instance.uptime().map(|d| d.num_seconds()),
                memory_usage_mb: instance.memory_mb(),
                cpu_usage_percent: instance.cpu_percent(),
                request_count: instance.request_count,
            },
            None => ModelStatus {
                status: "stopped".to_string(),
                port: Some(config.port),
                priority: config.priority,
                resource_group: config.resource_group.clone(),
                preload: config.preload,
                auto_start: config.auto_start,
                last_accessed: None,
                uptime_seconds: None,
                memory_usage_mb: None,
                cpu_usage_percent: None,
                request_count: 0,
            },
        })
    }

    pub async fn get_all_model_status(&self) -> HashMap<String, ModelStatus> {
        let names: Vec<String> = {
            let guard = self.inner.lock().await;
            guard.configs.keys().cloned().collect()
        };
        let mut out = HashMap::new();
        for name in names {
            if let Some(status) = self.get_model_status(&name).await {
                out.insert(name, status);
            }
        }
        out
    }

    pub async fn models_by_priority(&self) -> Vec<String> {
        let guard = self.inner.lock().await;
        let mut configs: Vec<&ModelConfig> = guard.configs.values().collect();
        configs.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        configs.into_iter().map(|c| c.name.clone()).collect()
    }

    /// Every `idle_timeout`-respecting sweep tick: stop instances idle
    /// beyond the configured timeout, excluding preloaded ones.
    async fn evict_idle(&self) {
        let mut guard = self.inner.lock().await;
        let now = chrono::Utc::now();
        let idle_timeout = self.idle_timeout;

        let to_evict: Vec<String> = guard
            .models
            .iter()
            .filter(|(_, instance)| {
                !instance.config.preload
                    && instance
                        .last_accessed
                        .map(|t| now.signed_duration_since(t) > idle_timeout)
                        .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in to_evict {
            info!(model = %name, "evicting idle model");
            if let Some(mut instance) = guard.models.remove(&name) {
                instance.stop(&self.queue_manager).await;
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        let names: Vec<String> = guard.models.keys().cloned().collect();
        for name in names {
            if let Some(mut instance) = guard.models.remove(&name) {
                instance.stop(&self.queue_manager).await;
            }
        }
    }
}

/// Cheap, `Clone`-free snapshot of the fields the forwarder needs after
/// `get_or_start` returns — avoids holding the manager lock for the
/// duration of a forward.
pub struct ModelSnapshot {
    pub base_url: String,
}

impl From<&ModelInstance> for ModelSnapshot {
    fn from(instance: &ModelInstance) -> Self {
        Self {
            base_url: instance.base_url(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelStatus {
    pub status: String,
    pub port: Option<u16>,
    pub priority: u8,
    pub resource_group: String,
    pub preload: bool,
    pub auto_start: bool,
    pub last_accessed: Option<chrono::DateTime<chrono::Utc>>,
    pub uptime_seconds: Option<i64>,
    pub memory_usage_mb: Option<f64>,
    pub cpu_usage_percent: Option<f32>,
    pub request_count: u64,
}

/// Background task: every 30s, evict idle non-preload instances.
pub async fn run_eviction_loop(manager: Arc<ModelManager>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        manager.evict_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, port: u16, priority: u8) -> ModelConfig {
        ModelConfig {
            name: name.to_string(),
            port,
            model_path: "/models/a.gguf".into(),
            context_length: 2048,
            gpu_layers: -1,
            chat_format: "chatml".into(),
            auto_start: false,
            preload: false,
            priority,
            resource_group: "default".into(),
            additional_args: vec![],
        }
    }

    fn gateway_config() -> GatewayConfig {
        GatewayConfig {
            max_concurrent_models: 4,
            timeout_minutes: 5,
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn get_or_start_returns_none_for_unconfigured_model() {
        let qm = Arc::new(QueueManager::new());
        let mgr = ModelManager::new(qm, &gateway_config());
        assert!(mgr.get_or_start("ghost").await.is_none());
    }

    #[tokio::test]
    async fn stop_unknown_model_is_idempotent_success() {
        let qm = Arc::new(QueueManager::new());
        let mgr = ModelManager::new(qm, &gateway_config());
        assert!(mgr.stop("ghost").await);
        assert!(mgr.stop("ghost").await);
    }

    #[tokio::test]
    async fn models_by_priority_breaks_ties_by_name() {
        let qm = Arc::new(QueueManager::new());
        let mgr = ModelManager::new(qm, &gateway_config());
        let mut configs = HashMap::new();
        configs.insert("zeta".to_string(), config("zeta", 11001, 5));
        configs.insert("alpha".to_string(), config("alpha", 11002, 5));
        configs.insert("high".to_string(), config("high", 11003, 9));
        mgr.load_configs(configs).await;

        let order = mgr.models_by_priority().await;
        assert_eq!(order, vec!["high", "alpha", "zeta"]);
    }

    #[tokio::test]
    async fn get_model_status_reports_stopped_for_unstarted_config() {
        let qm = Arc::new(QueueManager::new());
        let mgr = ModelManager::new(qm, &gateway_config());
        let mut configs = HashMap::new();
        configs.insert("m1".to_string(), config("m1", 11004, 5));
        mgr.load_configs(configs).await;

        let status = mgr.get_model_status("m1").await.unwrap();
        assert_eq!(status.status, "stopped");
        assert_eq!(status.request_count, 0);
    }

    #[tokio::test]
    async fn get_model_status_none_for_unconfigured_name() {
        let qm = Arc::new(QueueManager::new());
        let mgr = ModelManager::new(qm, &gateway_config());
        assert!(mgr.get_model_status("ghost").await.is_none());
    }

    #[tokio::test]
    async fn reload_without_config_or_existing_instance_fails() {
        let qm = Arc::new(QueueManager::new());
        let mgr = ModelManager::new(qm, &gateway_config());
        let outcome = mgr.reload("ghost", None).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn reload_while_stopped_leaves_model_stopped() {
        let qm = Arc::new(QueueManager::new());
        let mgr = ModelManager::new(qm.clone(), &gateway_config());
        let mut configs = HashMap::new();
        configs.insert("m1".to_string(), config("m1", 11005, 5));
        mgr.load_configs(configs).await;

        let outcome = mgr.reload("m1", None).await;
        assert!(outcome.success);
        assert_eq!(qm.get_state("m1").await, ModelState::Stopped);
    }
}
