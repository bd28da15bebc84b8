//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file does not exist
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    /// IO error reading the file
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing failed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// A field failed validation
    #[error("Invalid configuration for {field}: {message}")]
    Validation { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = ConfigError::NotFound(PathBuf::from("/etc/hestia.yml"));
        assert!(err.to_string().contains("/etc/hestia.yml"));
    }

    #[test]
    fn test_validation_display() {
        let err = ConfigError::Validation {
            field: "services.svc-a.base_url".to_string(),
            message: "must not be empty".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration for services.svc-a.base_url: must not be empty"
        );
    }
}
