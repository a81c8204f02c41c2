//! Fixed window policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::WindowPolicy;
use crate::clock::from_millis;
use crate::error::Result;
use crate::settings::{whole_millis, PolicySettings};

/// Counts attempts since the window opened.
///
/// Rollover is lazy: once `window` has elapsed since the last attempt the
/// stored counter is stale and the next update starts a new window at `now`.
/// Nothing ever sweeps counters proactively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindow {
    window: Duration,
    window_ms: i64,
}

/// Stored state for [`FixedWindow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FixedWindowMetrics {
    /// Attempts recorded in the current window
    pub attempt: u64,
    /// Epoch milliseconds of the most recent attempt
    pub last_attempt_at: i64,
}

impl FixedWindow {
    /// Create a policy with the given window.
    ///
    /// The window must be a positive whole number of milliseconds.
    pub fn new(window: Duration) -> Result<Self> {
        let window_ms = whole_millis("window", window)?;
        Ok(Self { window, window_ms })
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    fn rolled_over(&self, metrics: &FixedWindowMetrics, now: DateTime<Utc>) -> bool {
        now.timestamp_millis().saturating_sub(metrics.last_attempt_at) >= self.window_ms
    }
}

impl WindowPolicy for FixedWindow {
    type Metrics = FixedWindowMetrics;

    fn initial_metrics(&self, now: DateTime<Utc>) -> FixedWindowMetrics {
        FixedWindowMetrics {
            attempt: 0,
            last_attempt_at: now.timestamp_millis(),
        }
    }

    fn should_block(&self, metrics: &FixedWindowMetrics, limit: u64, now: DateTime<Utc>) -> bool {
        !self.rolled_over(metrics, now) && metrics.attempt >= limit
    }

    fn update_metrics(&self, metrics: FixedWindowMetrics, now: DateTime<Utc>) -> FixedWindowMetrics {
        let attempt = if self.rolled_over(&metrics, now) {
            1
        } else {
            metrics.attempt + 1
        };
        FixedWindowMetrics {
            attempt,
            last_attempt_at: now.timestamp_millis(),
        }
    }

    fn expiration(&self, metrics: &FixedWindowMetrics, _now: DateTime<Utc>) -> DateTime<Utc> {
        from_millis(metrics.last_attempt_at.saturating_add(self.window_ms))
    }

    fn attempts(&self, metrics: &FixedWindowMetrics, now: DateTime<Utc>) -> u64 {
        if self.rolled_over(metrics, now) {
            0
        } else {
            metrics.attempt
        }
    }

    fn to_settings(&self) -> PolicySettings {
        PolicySettings::FixedWindow {
            window: Some(self.window),
        }
    }
}
