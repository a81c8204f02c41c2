//! Sliding window policy.
//!
//! Approximates a sliding log with two counters: the bucket for the current
//! window and the one before it. The previous bucket is weighted by how much
//! of it still overlaps a window ending at `now`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::WindowPolicy;
use crate::clock::from_millis;
use crate::error::Result;
use crate::settings::{non_negative_millis, whole_millis, PolicySettings};

/// Weighted two-bucket sliding window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindow {
    window: Duration,
    margin: Duration,
    window_ms: i64,
    margin_ms: i64,
}

/// Attempt counts keyed by bucket start (epoch milliseconds, a multiple of
/// the window length).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlidingWindowMetrics(pub BTreeMap<i64, u64>);

#[derive(Debug, Clone, Copy)]
struct Buckets {
    current: i64,
    previous: i64,
}

impl SlidingWindow {
    /// Create a policy with the default margin of a quarter window, rounded
    /// down to whole milliseconds.
    ///
    /// The window must be a positive whole number of milliseconds.
    pub fn new(window: Duration) -> Result<Self> {
        let window_ms = whole_millis("window", window)?;
        Self::with_margin(window, Duration::from_millis((window_ms / 4) as u64))
    }

    /// Create a policy with an explicit expiration margin.
    pub fn with_margin(window: Duration, margin: Duration) -> Result<Self> {
        Ok(Self {
            window,
            margin,
            window_ms: whole_millis("window", window)?,
            margin_ms: non_negative_millis("margin", margin)?,
        })
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Extra lifetime granted to records past two full windows.
    pub fn margin(&self) -> Duration {
        self.margin
    }

    fn buckets(&self, now: DateTime<Utc>) -> Buckets {
        let w = self.window_ms;
        let current = now.timestamp_millis().div_euclid(w) * w;
        Buckets {
            current,
            previous: current.saturating_sub(w),
        }
    }

    fn effective_attempts(&self, metrics: &SlidingWindowMetrics, now: DateTime<Utc>) -> u64 {
        let w = self.window_ms;
        let buckets = self.buckets(now);
        let current = metrics.0.get(&buckets.current).copied().unwrap_or(0);
        let raw_previous = metrics.0.get(&buckets.previous).copied().unwrap_or(0);

        let elapsed_fraction = now.timestamp_millis().rem_euclid(w) as f64 / w as f64;
        let previous = ((1.0 - elapsed_fraction) * raw_previous as f64).floor() as u64;

        current + previous
    }
}

impl WindowPolicy for SlidingWindow {
    type Metrics = SlidingWindowMetrics;

    fn initial_metrics(&self, _now: DateTime<Utc>) -> SlidingWindowMetrics {
        SlidingWindowMetrics::default()
    }

    fn should_block(&self, metrics: &SlidingWindowMetrics, limit: u64, now: DateTime<Utc>) -> bool {
        self.effective_attempts(metrics, now) >= limit
    }

    fn update_metrics(&self, mut metrics: SlidingWindowMetrics, now: DateTime<Utc>) -> SlidingWindowMetrics {
        let buckets = self.buckets(now);
        metrics.0.retain(|start, _| *start >= buckets.previous);
        *metrics.0.entry(buckets.current).or_insert(0) += 1;
        metrics
    }

    fn expiration(&self, _metrics: &SlidingWindowMetrics, now: DateTime<Utc>) -> DateTime<Utc> {
        let buckets = self.buckets(now);
        from_millis(
            buckets
                .current
                .saturating_add(self.window_ms.saturating_mul(2))
                .saturating_add(self.margin_ms),
        )
    }

    fn attempts(&self, metrics: &SlidingWindowMetrics, now: DateTime<Utc>) -> u64 {
        self.effective_attempts(metrics, now)
    }

    fn to_settings(&self) -> PolicySettings {
        PolicySettings::SlidingWindow {
            window: Some(self.window),
            margin: Some(self.margin),
        }
    }
}
