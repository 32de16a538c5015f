//! Error types for topolab-core.

use ipnet::Ipv4Net;
use thiserror::Error;

/// Result type alias for topolab-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while managing environments.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from the backend driver, passed through unchanged
    #[error("backend error: {0}")]
    Backend(#[from] topolab_driver::DriverError),

    /// No saved environment with this id
    #[error("environment not found: {0}")]
    NotFound(String),

    /// Operation requires a condition that does not hold
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Every candidate block overlaps a reserved or allocated one
    #[error("address pool exhausted")]
    PoolExhausted,

    /// Block returned to the pool was never handed out
    #[error("address block {0} is not allocated")]
    NotAllocated(Ipv4Net),

    /// Block is allocated, but not to the environment returning it
    #[error("address block {block} is not allocated to {owner}")]
    NotOwned {
        /// Block being returned
        block: Ipv4Net,
        /// Environment that tried to return it
        owner: String,
    },

    /// Fetching a remote resource failed
    #[error("download of {url} failed: {reason}")]
    Download {
        /// Source URL
        url: String,
        /// Failure description
        reason: String,
    },

    /// Host routing table could not be read
    #[error("failed to read host routes: {0}")]
    HostRoutes(String),

    /// Invalid environment state for operation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Shorthand for a download failure.
    pub fn download(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Download {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error indicates a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }

    /// Check if retrying the whole operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Download { .. } | CoreError::PoolExhausted | CoreError::Backend(_)
        )
    }
}
