//! Shared scenario driver and helpers for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use turnstile::{BackoffPolicy, DatabaseStorage, ManualClock, RateLimiterBackend, RateLimiterState};

/// Deterministic backoff so that every adapter reports the same reset time.
pub fn exponential_without_jitter() -> BackoffPolicy {
    BackoffPolicy::Exponential {
        min_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

/// Backoff whose delays vary from call to call.
pub fn linear_with_jitter() -> BackoffPolicy {
    BackoffPolicy::Linear {
        min_delay: Duration::from_millis(700),
        max_delay: Duration::from_secs(30),
        jitter: 0.5,
    }
}

/// One operation against a backend at a point in time relative to the
/// scenario start.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Hit { at: i64, key: &'static str, limit: u64 },
    Peek { at: i64, key: &'static str, limit: u64 },
    Reset { key: &'static str },
}

/// Steps exercising thresholds, rollover, per-key isolation and reset.
///
/// No key is peeked after its record expired, so the outcome does not depend
/// on how a backend expires records.
pub fn common_steps() -> Vec<Step> {
    use Step::*;
    vec![
        Hit { at: 0, key: "a", limit: 3 },
        Hit { at: 100, key: "a", limit: 3 },
        Hit { at: 200, key: "a", limit: 3 },
        Hit { at: 300, key: "a", limit: 3 },
        Peek { at: 400, key: "a", limit: 3 },
        Hit { at: 450, key: "b", limit: 1 },
        Hit { at: 460, key: "b", limit: 1 },
        Hit { at: 470, key: "b", limit: 1 },
        Peek { at: 500, key: "missing", limit: 3 },
        Hit { at: 1_100, key: "a", limit: 3 },
        Hit { at: 1_200, key: "a", limit: 3 },
        Peek { at: 1_300, key: "a", limit: 3 },
        Hit { at: 1_500, key: "a", limit: 3 },
        Hit { at: 1_600, key: "a", limit: 3 },
        Reset { key: "a" },
        Peek { at: 1_700, key: "a", limit: 3 },
        Hit { at: 1_800, key: "a", limit: 3 },
        Hit { at: 2_100, key: "b", limit: 1 },
    ]
}

/// Extra steps that read a key after its record expired.
pub fn expiry_steps() -> Vec<Step> {
    use Step::*;
    vec![
        Hit { at: 10_000, key: "c", limit: 2 },
        Peek { at: 60_000, key: "c", limit: 2 },
        Hit { at: 60_100, key: "c", limit: 2 },
    ]
}

/// Run `steps` against `backend`, moving `clock` to `base + at` before each
/// timed step.
pub async fn run(
    backend: &dyn RateLimiterBackend,
    clock: &ManualClock,
    base: i64,
    steps: &[Step],
) -> Vec<Option<RateLimiterState>> {
    let mut outcomes = Vec::with_capacity(steps.len());
    for step in steps {
        let outcome = match *step {
            Step::Hit { at, key, limit } => {
                clock.set_millis(base + at);
                Some(backend.update_state(key, limit).await.unwrap())
            }
            Step::Peek { at, key, limit } => {
                clock.set_millis(base + at);
                backend.get_state(key, limit).await.unwrap()
            }
            Step::Reset { key } => {
                backend.reset(key).await.unwrap();
                None
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}

/// A single-connection in-memory SQLite storage.
pub async fn memory_database(clock: ManualClock) -> DatabaseStorage {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let storage = DatabaseStorage::with_clock(pool, std::sync::Arc::new(clock));
    storage.migrate().await.unwrap();
    storage
}

/// Assert two outcome sequences agree under a jittered `backoff`.
///
/// Success and attempt must match exactly. Reset times must be present on
/// the same steps and each must lie within the range `backoff` can produce
/// for its attempt.
pub fn assert_agree_with_jitter(
    expected: &[Option<RateLimiterState>],
    actual: &[Option<RateLimiterState>],
    backoff: &BackoffPolicy,
) {
    assert_eq!(expected.len(), actual.len());
    for (step, (expected, actual)) in expected.iter().zip(actual).enumerate() {
        match (expected, actual) {
            (None, None) => {}
            (Some(expected), Some(actual)) => {
                assert_eq!(
                    (expected.success, expected.attempt),
                    (actual.success, actual.attempt),
                    "step {step}"
                );
                assert_eq!(expected.reset_time.is_some(), actual.reset_time.is_some(), "step {step}");
                let shortest = backoff.next_delay(expected.attempt, 1.0);
                let longest = backoff.next_delay(expected.attempt, 0.0);
                for reset in [expected.reset_time, actual.reset_time].into_iter().flatten() {
                    assert!(
                        (shortest..=longest).contains(&reset),
                        "step {step}: {reset:?} outside {shortest:?}..={longest:?}"
                    );
                }
            }
            _ => panic!("step {step}: {expected:?} vs {actual:?}"),
        }
    }
}

pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

/// Check if Redis is available before running tests
pub async fn redis_available() -> bool {
    match redis::Client::open(redis_url()) {
        Ok(client) => client.get_multiplexed_async_connection().await.is_ok(),
        Err(_) => false,
    }
}
