//! Per-service configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single concrete upstream instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance base URL
    pub url: String,
    /// Relative weight for load balancing
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Optional region label
    #[serde(default)]
    pub region: Option<String>,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

/// Strategy-specific routing table.
///
/// `by_model` maps the value of the configured `model_key` (peeked from small
/// JSON request bodies) to an instance URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RoutingTable {
    pub model_key: Option<String>,
    pub by_model: HashMap<String, String>,
}

impl RoutingTable {
    /// Key name used to extract the model from request bodies.
    pub fn model_key(&self) -> &str {
        self.model_key.as_deref().unwrap_or("model")
    }
}

/// Remote execution block. When enabled, startup and shutdown are delegated
/// to the external automation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub machine_id: String,
    pub start_template_id: i64,
    pub stop_template_id: i64,
    pub task_timeout_s: u64,
    pub poll_interval_s: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            machine_id: String::new(),
            start_template_id: 1,
            stop_template_id: 2,
            task_timeout_s: 300,
            poll_interval_s: 2,
        }
    }
}

/// Configuration for one managed service.
///
/// Immutable between reloads; keyed by service id in the top-level config map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service id, filled from the config map key
    #[serde(skip)]
    pub service_id: String,
    /// Primary upstream base URL
    pub base_url: String,
    /// Fallback upstream, tried once after all primary attempts fail
    pub fallback_url: Option<String>,
    /// Readiness endpoint; when absent, readiness is a warm-up timer
    pub health_url: Option<String>,
    /// Warm-up duration in milliseconds (used when health_url is unset)
    pub warmup_ms: u64,
    /// Idle period after which the service is shut down; 0 disables
    pub idle_timeout_ms: u64,
    /// Number of primary startup attempts
    pub retry_count: u32,
    /// Delay between primary attempts
    pub retry_delay_ms: u64,
    /// Maximum parked requests during a cold start
    pub queue_size: usize,
    /// Per-request (and per-startup-attempt readiness) deadline
    pub request_timeout_seconds: u64,
    /// Named routing strategy; absent means plain base_url
    #[serde(alias = "strategy")]
    pub strategy_name: Option<String>,
    /// Upstream instances available to strategies
    pub instances: Vec<InstanceConfig>,
    /// Strategy-specific routing table
    pub routing: RoutingTable,
    /// Remote executor block
    pub remote: Option<RemoteConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_id: String::new(),
            base_url: String::new(),
            fallback_url: None,
            health_url: None,
            warmup_ms: 0,
            idle_timeout_ms: 0,
            retry_count: 1,
            retry_delay_ms: 1000,
            queue_size: 100,
            request_timeout_seconds: 60,
            strategy_name: None,
            instances: Vec::new(),
            routing: RoutingTable::default(),
            remote: None,
        }
    }
}

impl ServiceConfig {
    /// Whether remote orchestration is enabled for this service.
    pub fn remote_enabled(&self) -> bool {
        self.remote.as_ref().is_some_and(|r| r.enabled)
    }

    /// Apply `<UPPER_SERVICE_ID>_<FIELD>` environment overrides.
    ///
    /// Hyphens in the service id map to underscores. Unparseable values are
    /// ignored and the configured value is kept.
    pub fn with_env_overrides(mut self) -> Self {
        let prefix = self.service_id.to_uppercase().replace('-', "_");

        if let Ok(v) = std::env::var(format!("{prefix}_BASE_URL")) {
            self.base_url = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_FALLBACK_URL")) {
            self.fallback_url = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{prefix}_HEALTH_URL")) {
            self.health_url = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{prefix}_WARMUP_MS")) {
            if let Ok(n) = v.parse() {
                self.warmup_ms = n;
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}_IDLE_TIMEOUT_MS")) {
            if let Ok(n) = v.parse() {
                self.idle_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}_RETRY_COUNT")) {
            if let Ok(n) = v.parse() {
                self.retry_count = n;
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}_RETRY_DELAY_MS")) {
            if let Ok(n) = v.parse() {
                self.retry_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}_QUEUE_SIZE")) {
            if let Ok(n) = v.parse() {
                self.queue_size = n;
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}_REQUEST_TIMEOUT_SECONDS")) {
            if let Ok(n) = v.parse() {
                self.request_timeout_seconds = n;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_config_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.warmup_ms, 0);
        assert_eq!(config.idle_timeout_ms, 0);
        assert_eq!(config.retry_count, 1);
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.request_timeout_seconds, 60);
        assert!(config.fallback_url.is_none());
        assert!(!config.remote_enabled());
    }

    #[test]
    fn test_routing_table_model_key_default() {
        let routing = RoutingTable::default();
        assert_eq!(routing.model_key(), "model");

        let routing = RoutingTable {
            model_key: Some("engine".to_string()),
            by_model: HashMap::new(),
        };
        assert_eq!(routing.model_key(), "engine");
    }

    #[test]
    fn test_parse_service_yaml() {
        let yaml = r#"
base_url: http://ollama-1:11434
health_url: http://ollama-1:11434/api/tags
idle_timeout_ms: 300000
retry_count: 3
strategy: model_router
instances:
  - url: http://ollama-1:11434
    region: us-east
  - url: http://ollama-2:11434
    weight: 2
routing:
  by_model:
    llama3: http://ollama-1:11434
"#;
        let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.base_url, "http://ollama-1:11434");
        assert_eq!(config.strategy_name.as_deref(), Some("model_router"));
        assert_eq!(config.instances.len(), 2);
        assert_eq!(config.instances[0].weight, 1);
        assert_eq!(config.instances[1].weight, 2);
        assert_eq!(
            config.routing.by_model.get("llama3").map(String::as_str),
            Some("http://ollama-1:11434")
        );
    }

    #[test]
    fn test_parse_remote_block() {
        let yaml = r#"
base_url: http://gpu-box:8000
remote:
  enabled: true
  machine_id: gpu-box
  start_template_id: 7
  stop_template_id: 8
"#;
        let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.remote_enabled());
        let remote = config.remote.unwrap();
        assert_eq!(remote.machine_id, "gpu-box");
        assert_eq!(remote.task_timeout_s, 300);
        assert_eq!(remote.poll_interval_s, 2);
    }

    #[test]
    fn test_env_override_maps_hyphens() {
        std::env::set_var("SVC_A_BASE_URL", "http://override:9000");
        std::env::set_var("SVC_A_QUEUE_SIZE", "7");
        let config = ServiceConfig {
            service_id: "svc-a".to_string(),
            base_url: "http://original:8000".to_string(),
            ..ServiceConfig::default()
        }
        .with_env_overrides();
        std::env::remove_var("SVC_A_BASE_URL");
        std::env::remove_var("SVC_A_QUEUE_SIZE");

        assert_eq!(config.base_url, "http://override:9000");
        assert_eq!(config.queue_size, 7);
    }

    #[test]
    fn test_env_override_invalid_value_ignored() {
        std::env::set_var("SVC_B_RETRY_COUNT", "lots");
        let config = ServiceConfig {
            service_id: "svc-b".to_string(),
            retry_count: 2,
            ..ServiceConfig::default()
        }
        .with_env_overrides();
        std::env::remove_var("SVC_B_RETRY_COUNT");

        assert_eq!(config.retry_count, 2);
    }
}
