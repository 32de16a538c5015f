//! Error types for topolab-driver.

use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors a backend can report while realizing or tearing down resources.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Failed to create a resource
    #[error("failed to create {resource}: {reason}")]
    Create { resource: String, reason: String },

    /// Failed to delete a resource
    #[error("failed to delete {resource}: {reason}")]
    Delete { resource: String, reason: String },

    /// Failed to start a resource
    #[error("failed to start {0}")]
    Start(String),

    /// Failed to stop a resource
    #[error("failed to stop {0}")]
    Stop(String),

    /// The backend has no record of the resource
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The resource has no driver attached
    #[error("no driver attached to {0}")]
    Detached(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// Shorthand for a creation failure.
    pub fn create(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Create {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a deletion failure.
    pub fn delete(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Delete {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}
