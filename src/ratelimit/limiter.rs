//! Core rate limiter implementation.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::{validate_limit, RateLimiterBackend, RateLimiterState};
use super::backoff::BackoffPolicy;
use super::policy::WindowPolicy;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, ThrottleError};
use crate::storage::{RateLimiterData, Storage};

/// Rate limiter composing a window policy, a backoff policy and a storage.
///
/// The limiter holds no lock of its own: every update runs inside one storage
/// transaction, and the storage is responsible for making that transaction
/// atomic per key.
pub struct RateLimiter<P, S> {
    policy: P,
    backoff: BackoffPolicy,
    storage: S,
    clock: Arc<dyn Clock>,
}

impl<P: WindowPolicy, S: Storage> RateLimiter<P, S> {
    /// Create a rate limiter on the system clock.
    pub fn new(policy: P, backoff: BackoffPolicy, storage: S) -> Result<Self> {
        Self::with_clock(policy, backoff, storage, Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter reading time from `clock`.
    ///
    /// Fails if the backoff parameters are out of range.
    pub fn with_clock(policy: P, backoff: BackoffPolicy, storage: S, clock: Arc<dyn Clock>) -> Result<Self> {
        backoff.validate()?;
        Ok(Self {
            policy,
            backoff,
            storage,
            clock,
        })
    }

    /// The window policy.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// The underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn decode(&self, key: &str, data: &RateLimiterData) -> Result<P::Metrics> {
        serde_json::from_str(&data.state).map_err(|e| ThrottleError::TypeMismatch {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn reset_time(&self, blocked: bool, attempt: u64) -> Option<std::time::Duration> {
        blocked.then(|| self.backoff.next_delay(attempt, rand::random::<f64>()))
    }
}

#[async_trait]
impl<P: WindowPolicy, S: Storage> RateLimiterBackend for RateLimiter<P, S> {
    async fn get_state(&self, key: &str, limit: u64) -> Result<Option<RateLimiterState>> {
        validate_limit(limit)?;
        let Some(data) = self.storage.find(key).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        let metrics = self.decode(key, &data)?;
        let blocked = self.policy.should_block(&metrics, limit, now);
        let attempt = self.policy.attempts(&metrics, now);

        Ok(Some(RateLimiterState {
            success: !blocked,
            attempt,
            reset_time: self.reset_time(blocked, attempt),
        }))
    }

    async fn update_state(&self, key: &str, limit: u64) -> Result<RateLimiterState> {
        validate_limit(limit)?;
        let now = self.clock.now();

        trace!(key = %key, limit, "Checking rate limit");

        let mut trx = self.storage.transaction().await?;
        let prior = match trx.find(key).await? {
            Some(data) => self.decode(key, &data)?,
            None => {
                debug!(key = %key, "Creating new rate limit record");
                self.policy.initial_metrics(now)
            }
        };

        let blocked = self.policy.should_block(&prior, limit, now);
        let updated = self.policy.update_metrics(prior, now);
        let expiration = self.policy.expiration(&updated, now);
        let state = serde_json::to_string(&updated)?;

        trx.upsert(
            key,
            RateLimiterData {
                state,
                expiration: Some(expiration),
            },
        )
        .await?;
        trx.commit().await?;

        let attempt = self.policy.attempts(&updated, now);
        if blocked {
            debug!(key = %key, attempt, limit, "Rate limit exceeded");
        }

        Ok(RateLimiterState {
            success: !blocked,
            attempt,
            reset_time: self.reset_time(blocked, attempt),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.storage.remove(key).await?;
        debug!(key = %key, "Rate limit reset");
        Ok(())
    }
}
