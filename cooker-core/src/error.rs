use thiserror::Error;

#[derive(Error, Debug)]
pub enum CookError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Build cache error: {0}")]
    Cache(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CookError {
    /// Errors that end the cook session rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CookError::Cache(_) | CookError::InvariantViolation(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CookError>;
