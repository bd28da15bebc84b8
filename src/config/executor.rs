//! Remote executor configuration

use serde::{Deserialize, Serialize};

/// Global settings for the external automation service used to start and
/// stop services on remote machines. Absent `base_url` disables remote
/// orchestration even for services whose `remote` block is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub base_url: Option<String>,
    pub timeout_seconds: u64,
    pub project_id: i64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_seconds: 30,
            project_id: 1,
        }
    }
}

impl ExecutorConfig {
    pub fn is_configured(&self) -> bool {
        self.base_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_config_defaults() {
        let config = ExecutorConfig::default();
        assert!(!config.is_configured());
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.project_id, 1);
    }

    #[test]
    fn test_executor_configured() {
        let config = ExecutorConfig {
            base_url: Some("http://semaphore:3000".to_string()),
            ..ExecutorConfig::default()
        };
        assert!(config.is_configured());
    }
}
