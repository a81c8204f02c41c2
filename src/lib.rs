//! Turnstile - Rate Limiting Engine
//!
//! This crate decides whether a caller identified by a key may proceed, given
//! a per-call limit. Two window algorithms are available (fixed and sliding),
//! blocked callers receive a backoff delay, and state lives in one of three
//! storage backends: a process-local map, a SQL database, or Redis, where the
//! whole update runs as a single server-side script.
//!
//! ```no_run
//! use std::time::Duration;
//! use turnstile::{BackoffPolicy, FixedWindow, MemoryStorage, RateLimiter, RateLimiterBackend};
//!
//! # async fn run() -> turnstile::Result<()> {
//! let limiter = RateLimiter::new(
//!     FixedWindow::new(Duration::from_secs(60))?,
//!     BackoffPolicy::default(),
//!     MemoryStorage::new(),
//! )?;
//! let state = limiter.update_state("user:42", 100).await?;
//! if !state.success {
//!     println!("retry in {:?}", state.reset_time);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod redis_script;
pub mod settings;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, ThrottleError};
pub use ratelimit::{
    BackoffPolicy, FixedWindow, RateLimiter, RateLimiterBackend, RateLimiterState, SlidingWindow,
    WindowPolicy,
};
pub use redis_script::RedisRateLimiter;
pub use settings::{BackoffSettings, PolicySettings, ResolvedPolicy};
pub use storage::{DatabaseStorage, MemoryStorage, RateLimiterData, Storage, StorageTransaction};
