//! Rate limiter trait for abstracting storage-backed and script-backed implementations.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::{Result, ThrottleError};

/// Outcome of a rate limit check for one key.
///
/// Serializes as `{"success":false,"attempt":6,"resetTime":60000}`, with the
/// reset time in milliseconds and omitted when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterState {
    /// Whether the attempt was admitted
    pub success: bool,
    /// Attempts counted toward the limit, including this one
    pub attempt: u64,
    /// Suggested wait before retrying; only set when blocked
    #[serde(
        serialize_with = "crate::settings::millis::serialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub reset_time: Option<Duration>,
}

/// Trait for rate limiter implementations.
///
/// Both the storage-backed [`RateLimiter`](super::RateLimiter) and the Redis
/// script adapter implement this, so callers can hold either behind a
/// `Box<dyn RateLimiterBackend>`.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Current state of `key` evaluated at the current time, without
    /// recording an attempt. `None` if the key has no stored record.
    async fn get_state(&self, key: &str, limit: u64) -> Result<Option<RateLimiterState>>;

    /// Record an attempt for `key` and decide whether it is admitted.
    async fn update_state(&self, key: &str, limit: u64) -> Result<RateLimiterState>;

    /// Forget everything stored for `key`.
    async fn reset(&self, key: &str) -> Result<()>;
}

/// Reject limits that can never admit anything.
pub(crate) fn validate_limit(limit: u64) -> Result<()> {
    if limit == 0 {
        return Err(ThrottleError::validation("limit must be a positive integer"));
    }
    Ok(())
}
