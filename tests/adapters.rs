//! The in-memory and database storages must produce identical outcomes for
//! the same sequence of calls.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{common_steps, exponential_without_jitter, expiry_steps, memory_database, run};
use turnstile::{
    Clock, FixedWindow, ManualClock, MemoryStorage, RateLimiter, RateLimiterState, SlidingWindow,
    WindowPolicy,
};

async fn compare<P: WindowPolicy + Clone>(policy: P) -> Vec<Option<RateLimiterState>> {
    let mut steps = common_steps();
    steps.extend(expiry_steps());

    let memory_clock = ManualClock::at_millis(0);
    let shared: Arc<dyn Clock> = Arc::new(memory_clock.clone());
    let memory = RateLimiter::with_clock(
        policy.clone(),
        exponential_without_jitter(),
        MemoryStorage::with_clock(shared.clone()),
        shared,
    )
    .unwrap();

    let database_clock = ManualClock::at_millis(0);
    let database = RateLimiter::with_clock(
        policy,
        exponential_without_jitter(),
        memory_database(database_clock.clone()).await,
        Arc::new(database_clock.clone()),
    )
    .unwrap();

    let from_memory = run(&memory, &memory_clock, 0, &steps).await;
    let from_database = run(&database, &database_clock, 0, &steps).await;
    assert_eq!(from_memory, from_database);

    memory.storage().clear().await;
    from_memory
}

fn blocked(attempt: u64, reset_ms: u64) -> Option<RateLimiterState> {
    Some(RateLimiterState {
        success: false,
        attempt,
        reset_time: Some(Duration::from_millis(reset_ms)),
    })
}

fn admitted(attempt: u64) -> Option<RateLimiterState> {
    Some(RateLimiterState {
        success: true,
        attempt,
        reset_time: None,
    })
}

#[tokio::test]
async fn test_fixed_window_adapters_agree() {
    let outcomes = compare(FixedWindow::new(Duration::from_millis(1_000)).unwrap()).await;

    assert_eq!(outcomes[0], admitted(1));
    assert_eq!(outcomes[2], admitted(3));
    assert_eq!(outcomes[3], blocked(4, 16_000));
    assert_eq!(outcomes[4], blocked(4, 16_000));
    assert_eq!(outcomes[5], admitted(1));
    assert_eq!(outcomes[6], blocked(2, 4_000));
    assert_eq!(outcomes[8], None);
    // Reset, then a peek and a fresh hit.
    assert_eq!(outcomes[14], None);
    assert_eq!(outcomes[15], None);
    assert_eq!(outcomes[16], admitted(1));
    // Expired records read as absent and restart the count.
    assert_eq!(outcomes[18], admitted(1));
    assert_eq!(outcomes[19], None);
    assert_eq!(outcomes[20], admitted(1));
}

#[tokio::test]
async fn test_sliding_window_adapters_agree() {
    let outcomes = compare(SlidingWindow::new(Duration::from_millis(1_000)).unwrap()).await;

    assert_eq!(outcomes[0], admitted(1));
    assert_eq!(outcomes[3], blocked(4, 16_000));
    assert_eq!(outcomes[8], None);
    assert_eq!(outcomes[15], None);
    assert_eq!(outcomes[16], admitted(1));
    assert_eq!(outcomes[19], None);
    assert_eq!(outcomes[20], admitted(1));
}

#[tokio::test]
async fn test_uneven_window_adapters_agree() {
    let window = Duration::from_millis(1_002);

    let fixed = compare(FixedWindow::new(window).unwrap()).await;
    assert_eq!(fixed[0], admitted(1));
    assert_eq!(fixed[3], blocked(4, 16_000));
    assert_eq!(fixed[16], admitted(1));

    let sliding = compare(SlidingWindow::new(window).unwrap()).await;
    assert_eq!(sliding[0], admitted(1));
    assert_eq!(sliding[3], blocked(4, 16_000));
    assert_eq!(sliding[20], admitted(1));
}
