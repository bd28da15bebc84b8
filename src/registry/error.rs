//! Registry error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Service id is not configured and no default service is set
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// A service with this id is already registered
    #[error("Duplicate service: {0}")]
    DuplicateService(String),
}
