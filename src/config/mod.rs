//! Configuration module for Hestia
//!
//! Provides layered configuration loading: a YAML file (default
//! `./hestia_config.yml`, overridable via `HESTIA_CONFIG`), environment
//! variable overrides, then validation.

pub mod error;
pub mod executor;
pub mod logging;
pub mod server;
pub mod service;

pub use error::ConfigError;
pub use executor::ExecutorConfig;
pub use logging::{LogFormat, LoggingConfig};
pub use server::ServerConfig;
pub use service::{InstanceConfig, RemoteConfig, RoutingTable, ServiceConfig};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default config file path, matching the deployment convention.
pub const DEFAULT_CONFIG_PATH: &str = "./hestia_config.yml";

/// Root configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HestiaConfig {
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
    /// Managed services, keyed by service id
    pub services: BTreeMap<String, ServiceConfig>,
}

impl HestiaConfig {
    /// Load configuration from a YAML file.
    ///
    /// If `path` is None, returns default configuration. A missing file is a
    /// `NotFound` error so startup can fail fast.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let content = std::fs::read_to_string(p)?;
                let mut config: HestiaConfig = serde_yaml::from_str(&content)
                    .map_err(|e| ConfigError::Parse(e.to_string()))?;
                config.stamp_service_ids();
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Global settings use `HESTIA_*`; per-service fields use
    /// `<UPPER_SERVICE_ID>_<FIELD>` with hyphens mapped to underscores.
    /// Invalid values are silently ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("HESTIA_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(host) = std::env::var("HESTIA_HOST") {
            self.server.host = host;
        }
        if let Ok(level) = std::env::var("HESTIA_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(url) = std::env::var("HESTIA_EXECUTOR_URL") {
            self.executor.base_url = Some(url);
        }

        self.services = self
            .services
            .into_iter()
            .map(|(id, cfg)| (id, cfg.with_env_overrides()))
            .collect();
        self
    }

    /// Validate configuration. Fatal at startup; on reload the caller keeps
    /// the previous configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation {
                field: "server.port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }

        if let Some(default) = &self.server.default_service {
            if !self.services.contains_key(default) {
                return Err(ConfigError::Validation {
                    field: "server.default_service".to_string(),
                    message: format!("unknown service '{default}'"),
                });
            }
        }

        for (id, service) in &self.services {
            if service.base_url.is_empty() {
                return Err(ConfigError::Validation {
                    field: format!("services.{id}.base_url"),
                    message: "must not be empty".to_string(),
                });
            }
            if service.queue_size == 0 {
                return Err(ConfigError::Validation {
                    field: format!("services.{id}.queue_size"),
                    message: "must be at least 1".to_string(),
                });
            }
            if service.request_timeout_seconds == 0 {
                return Err(ConfigError::Validation {
                    field: format!("services.{id}.request_timeout_seconds"),
                    message: "must be at least 1".to_string(),
                });
            }
            if service.remote_enabled() {
                let remote = service.remote.as_ref().unwrap();
                if remote.machine_id.is_empty() {
                    return Err(ConfigError::Validation {
                        field: format!("services.{id}.remote.machine_id"),
                        message: "required when remote is enabled".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Fill each service's `service_id` from its map key.
    fn stamp_service_ids(&mut self) {
        for (id, service) in self.services.iter_mut() {
            service.service_id = id.clone();
        }
    }
}
