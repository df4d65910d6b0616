//! Configuration types for the gateway and its managed models.
//!
//! Loaded once at startup from a YAML file (see [`load_model_configs`]); the
//! proxy-level scalar settings ([`GatewayConfig`]) are read from environment
//! variables the same way the original proxy's `ProxyConfig` was.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

fn default_context_length() -> i32 {
    4096
}

fn default_gpu_layers() -> i32 {
    -1
}

fn default_chat_format() -> String {
    "chatml".to_string()
}

fn default_priority() -> u8 {
    5
}

fn default_resource_group() -> String {
    "default".to_string()
}

/// Static, per-model configuration loaded by the config collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(skip)]
    pub name: String,
    pub port: u16,
    pub model_path: String,
    #[serde(default = "default_context_length")]
    pub context_length: i32,
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: i32,
    #[serde(default = "default_chat_format")]
    pub chat_format: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub preload: bool,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_resource_group")]
    pub resource_group: String,
    #[serde(default)]
    pub additional_args: Vec<String>,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1024..=65535).contains(&self.port) {
            bail!("model {}: port {} is out of valid range", self.name, self.port);
        }
        if self.context_length < 1 {
            bail!("model {}: context_length must be >= 1", self.name);
        }
        if !(1..=10).contains(&self.priority) {
            bail!("model {}: priority must be in 1..=10", self.name);
        }
        Ok(())
    }
}

/// Scalar gateway-wide settings (§6 "Configuration inputs"). `config_path`,
/// `dashboard_port`, `dashboard_enabled`, and `auth_enabled` are carried
/// over from the original `ProxyConfig` even though the dashboard and auth
/// middleware they describe are out of scope here — nothing in this crate
/// reads them yet, but dropping them would silently break anyone loading an
/// existing `ProxyConfig`-shaped environment into this gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub timeout_minutes: u64,
    pub max_concurrent_models: usize,
    pub health_check_interval_secs: u64,
    pub log_level: String,
    pub config_path: String,
    pub dashboard_port: u16,
    pub dashboard_enabled: bool,
    pub auth_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            timeout_minutes: 5,
            max_concurrent_models: 4,
            health_check_interval_secs: 30,
            log_level: "info".to_string(),
            config_path: "./config/models.yaml".to_string(),
            dashboard_port: 3000,
            dashboard_enabled: true,
            auth_enabled: true,
        }
    }
}

impl GatewayConfig {
    /// Build from environment variables, falling back to the documented
    /// defaults — mirrors `ConfigManager._load_proxy_config`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("GATEWAY_HOST").unwrap_or(defaults.host),
            port: std::env::var("GATEWAY_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            timeout_minutes: std::env::var("TIMEOUT_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_minutes),
            max_concurrent_models: std::env::var("MAX_CONCURRENT_MODELS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrent_models),
            health_check_interval_secs: std::env::var("HEALTH_CHECK_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.health_check_interval_secs),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            config_path: std::env::var("CONFIG_PATH").unwrap_or(defaults.config_path),
            dashboard_port: std::env::var("DASHBOARD_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.dashboard_port),
            dashboard_enabled: std::env::var("DASHBOARD_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.dashboard_enabled),
            auth_enabled: std::env::var("AUTH_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.auth_enabled),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    models: HashMap<String, ModelConfig>,
}

/// Load per-model configurations from a YAML file shaped like:
///
/// ```yaml
/// models:
///   m1:
///     port: 11001
///     model_path: /models/a.gguf
/// ```
///
/// Validates port uniqueness across all models (spec invariant) in addition
/// to per-model field validation.
pub fn load_model_configs(path: &Path) -> Result<HashMap<String, ModelConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let parsed: ModelsFile =
        serde_yaml::from_str(&raw).with_context(|| "invalid YAML in model config file")?;

    let mut configs = HashMap::new();
    for (name, mut cfg) in parsed.models {
        cfg.name = name.clone();
        cfg.validate()?;
        configs.insert(name, cfg);
    }

    validate_unique_ports(&configs)?;
    Ok(configs)
}

fn validate_unique_ports(configs: &HashMap<String, ModelConfig>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for cfg in configs.values() {
        if !seen.insert(cfg.port) {
            bail!("duplicate port {} across model configs", cfg.port);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_out_of_range_port() {
        let cfg = ModelConfig {
            name: "m1".into(),
            port: 80,
            model_path: "/tmp/a.gguf".into(),
            context_length: 2048,
            gpu_layers: -1,
            chat_format: "chatml".into(),
            auto_start: false,
            preload: false,
            priority: 5,
            resource_group: "default".into(),
            additional_args: vec![],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_priority() {
        let mut cfg = ModelConfig {
            name: "m1".into(),
            port: 11001,
            model_path: "/tmp/a.gguf".into(),
            context_length: 2048,
            gpu_layers: -1,
            chat_format: "chatml".into(),
            auto_start: false,
            preload: false,
            priority: 11,
            resource_group: "default".into(),
            additional_args: vec![],
        };
        assert!(cfg.validate().is_err());
        cfg.priority = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_model_configs_detects_duplicate_ports() {
        let mut configs = HashMap::new();
        configs.insert(
            "m1".to_string(),
            ModelConfig {
                name: "m1".into(),
                port: 11001,
                model_path: "/tmp/a.gguf".into(),
                context_length: 2048,
                gpu_layers: -1,
                chat_format: "chatml".into(),
                auto_start: false,
                preload: false,
                priority: 5,
                resource_group: "default".into(),
                additional_args: vec![],
            },
        );
        configs.insert(
            "m2".to_string(),
            ModelConfig {
                name: "m2".into(),
                port: 11001,
                model_path: "/tmp/b.gguf".into(),
                context_length: 2048,
                gpu_layers: -1,
                chat_format: "chatml".into(),
                auto_start: false,
                preload: false,
                priority: 5,
                resource_group: "default".into(),
                additional_args: vec![],
            },
        );
        assert!(validate_unique_ports(&configs).is_err());
    }

    #[test]
    fn gateway_config_default_matches_documented_values() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.timeout_minutes, 5);
        assert_eq!(cfg.max_concurrent_models, 4);
    }
}
