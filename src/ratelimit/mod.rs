//! Rate limiting logic and state management.

pub mod backoff;
pub mod policy;

mod backend;
mod limiter;

pub use backend::RateLimiterBackend;
pub use backend::RateLimiterState;
pub use backoff::BackoffPolicy;
pub use limiter::RateLimiter;
pub use policy::{FixedWindow, SlidingWindow, WindowPolicy};

pub(crate) use backend::validate_limit;
