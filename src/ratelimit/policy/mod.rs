//! Windowing policies.
//!
//! A policy owns the shape of the per-key metrics it tracks. Storage layers
//! only ever see the serialized form, so switching policies on a populated
//! store surfaces as a type mismatch when the old blob is decoded.

mod fixed_window;
mod sliding_window;

pub use fixed_window::{FixedWindow, FixedWindowMetrics};
pub use sliding_window::{SlidingWindow, SlidingWindowMetrics};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::settings::PolicySettings;

/// State transitions for a windowing policy.
///
/// Every method is pure: the policy never touches storage and never reads the
/// clock itself.
pub trait WindowPolicy: Send + Sync + 'static {
    /// Per-key state tracked by this policy.
    type Metrics: Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync;

    /// Metrics for a key that has never been seen.
    fn initial_metrics(&self, now: DateTime<Utc>) -> Self::Metrics;

    /// Whether the next attempt should be rejected.
    fn should_block(&self, metrics: &Self::Metrics, limit: u64, now: DateTime<Utc>) -> bool;

    /// Record one more attempt. Called for blocked attempts too.
    fn update_metrics(&self, metrics: Self::Metrics, now: DateTime<Utc>) -> Self::Metrics;

    /// When the stored record may be dropped.
    fn expiration(&self, metrics: &Self::Metrics, now: DateTime<Utc>) -> DateTime<Utc>;

    /// Attempts counted toward the limit at `now`.
    fn attempts(&self, metrics: &Self::Metrics, now: DateTime<Utc>) -> u64;

    /// Change detection for adapters that compare before writing.
    fn is_equal(&self, a: &Self::Metrics, b: &Self::Metrics) -> bool {
        a == b
    }

    /// Fully-populated settings for this policy.
    fn to_settings(&self) -> PolicySettings;
}
