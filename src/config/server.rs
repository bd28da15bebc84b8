//! Server configuration

use serde::{Deserialize, Serialize};

/// HTTP server and gateway-global settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Synthetic default for unknown service ids on the transparent path.
    /// Unset means unknown ids are rejected with 404.
    pub default_service: Option<String>,
    /// Readiness probe cadence during cold starts
    pub probe_interval_ms: u64,
    /// Idle monitor sweep cadence
    pub idle_sweep_interval_ms: u64,
    /// Require `X-Api-Key` on `/v1/*` management routes
    pub require_api_key: bool,
    /// Path to the embedded metadata store; unset disables persistence
    pub database_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            default_service: None,
            probe_interval_ms: 250,
            idle_sweep_interval_ms: 1000,
            require_api_key: false,
            database_path: Some("./hestia.db".to_string()),
        }
    }
}
