//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Malformed policy, backoff or call settings
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database storage failures
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis storage failures
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored metrics blob does not match the active policy
    #[error("Stored state for key '{key}' does not match the active policy: {reason}")]
    TypeMismatch { key: String, reason: String },

    /// Settings or results failed to encode/decode
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ThrottleError {
    /// Whether this error came from the persistence backend.
    pub fn is_storage(&self) -> bool {
        matches!(self, ThrottleError::Database(_) | ThrottleError::Redis(_))
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        ThrottleError::Validation(message.into())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
