//! Redis rate limiter backed by an atomic server-side script.
//!
//! The other adapters run the policy on the client and rely on a storage
//! transaction for atomicity. Here the whole read-modify-write runs inside a
//! Lua script, so an update is a single round trip that no other client can
//! interleave with.
//!
//! The script re-implements the window and backoff arithmetic. It receives
//! the resolved settings in their JSON transport form, plus the current time
//! and the jitter random value from the client, which keeps its output
//! identical to the in-process implementation for the same inputs.
//!
//! Records are stored as the policy's metrics JSON under
//! `{key_prefix}{key}`, expiring through `PEXPIREAT`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, ThrottleError};
use crate::ratelimit::{validate_limit, BackoffPolicy, RateLimiterBackend, RateLimiterState, WindowPolicy};

/// Lua source of the update script.
pub const SCRIPT_SOURCE: &str = include_str!("rate_limiter.lua");

/// Error code raised by the script when a stored record has the wrong shape.
const TYPE_MISMATCH: &str = "TYPE_MISMATCH";

/// Default prefix for Redis keys.
pub const DEFAULT_KEY_PREFIX: &str = "turnstile:";

/// Decoded script reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptReply {
    success: bool,
    attempt: u64,
    reset_time: i64,
}

impl From<ScriptReply> for RateLimiterState {
    fn from(reply: ScriptReply) -> Self {
        RateLimiterState {
            success: reply.success,
            attempt: reply.attempt,
            reset_time: u64::try_from(reply.reset_time)
                .ok()
                .map(Duration::from_millis),
        }
    }
}

/// Rate limiter that keeps its state in Redis.
pub struct RedisRateLimiter<P> {
    connection: ConnectionManager,
    policy: P,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    script: Script,
    policy_settings: String,
    backoff_settings: String,
}

impl<P: WindowPolicy> RedisRateLimiter<P> {
    /// Wrap an already-connected Redis handle.
    ///
    /// Fails if the settings cannot be encoded for the script.
    pub fn new(connection: ConnectionManager, policy: P, backoff: BackoffPolicy) -> Result<Self> {
        backoff.validate()?;
        let policy_settings = serde_json::to_string(&policy.to_settings().to_transport()?)?;
        let backoff_settings = serde_json::to_string(&backoff.to_settings().to_transport()?)?;
        Ok(Self {
            connection,
            policy,
            backoff,
            clock: Arc::new(SystemClock::new()),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            script: Script::new(SCRIPT_SOURCE),
            policy_settings,
            backoff_settings,
        })
    }

    /// Connect to `url` and register the script.
    pub async fn connect(url: &str, policy: P, backoff: BackoffPolicy) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        let limiter = Self::new(connection, policy, backoff)?;
        limiter.register().await?;
        Ok(limiter)
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Namespace all keys under `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Load the script into the server's script cache.
    ///
    /// Safe to call repeatedly. Invocations fall back to loading the script
    /// on `NOSCRIPT` anyway, so this only saves the first round trip.
    pub async fn register(&self) -> Result<String> {
        let mut connection = self.connection.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(SCRIPT_SOURCE)
            .query_async(&mut connection)
            .await?;
        info!(sha = %sha, "Registered rate limiter script");
        Ok(sha)
    }

    /// SHA1 of the script, as used by `EVALSHA`.
    pub fn script_hash(&self) -> &str {
        self.script.get_hash()
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn map_script_error(&self, key: &str, err: RedisError) -> ThrottleError {
        if err.code() == Some(TYPE_MISMATCH) {
            return ThrottleError::TypeMismatch {
                key: key.to_string(),
                reason: err.detail().unwrap_or_default().to_string(),
            };
        }
        ThrottleError::Redis(err)
    }
}

#[async_trait]
impl<P: WindowPolicy> RateLimiterBackend for RedisRateLimiter<P> {
    async fn get_state(&self, key: &str, limit: u64) -> Result<Option<RateLimiterState>> {
        validate_limit(limit)?;
        let mut connection = self.connection.clone();
        let stored: Option<String> = connection.get(self.key(key)).await?;
        let Some(stored) = stored else {
            return Ok(None);
        };

        let metrics: P::Metrics = serde_json::from_str(&stored).map_err(|e| ThrottleError::TypeMismatch {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let now = self.clock.now();
        let blocked = self.policy.should_block(&metrics, limit, now);
        let attempt = self.policy.attempts(&metrics, now);

        Ok(Some(RateLimiterState {
            success: !blocked,
            attempt,
            reset_time: blocked.then(|| self.backoff.next_delay(attempt, rand::random::<f64>())),
        }))
    }

    async fn update_state(&self, key: &str, limit: u64) -> Result<RateLimiterState> {
        validate_limit(limit)?;
        let now = self.clock.now().timestamp_millis();
        let random = rand::random::<f64>();

        trace!(key = %key, limit, "Checking rate limit via script");

        let mut connection = self.connection.clone();
        let reply: String = self
            .script
            .key(self.key(key))
            .arg(limit)
            .arg(&self.backoff_settings)
            .arg(&self.policy_settings)
            .arg(now)
            .arg(random)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| self.map_script_error(key, e))?;

        let state: RateLimiterState = serde_json::from_str::<ScriptReply>(&reply)?.into();
        if !state.success {
            debug!(key = %key, attempt = state.attempt, limit, "Rate limit exceeded");
        }
        Ok(state)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(self.key(key)).await?;
        debug!(key = %key, "Rate limit reset");
        Ok(())
    }
}
