//! Time sources for the rate limiters.
//!
//! All window arithmetic runs on wall-clock milliseconds since the Unix epoch,
//! because the same values are handed to the Redis script and persisted by
//! other processes.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock for deterministic tests.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock frozen at the given epoch milliseconds.
    pub fn at_millis(millis: i64) -> Self {
        Self::new(from_millis(millis))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        let mut current = self.current.lock();
        *current += Duration::milliseconds(by.as_millis() as i64);
    }

    /// Jump to the given epoch milliseconds.
    pub fn set_millis(&self, millis: i64) {
        *self.current.lock() = from_millis(millis);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

/// Epoch milliseconds to a timestamp, clamped to the representable range.
pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or(if millis > 0 {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}
