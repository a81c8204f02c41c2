//! In-process storage.
//!
//! Records live in a map guarded by an async mutex. A transaction holds the
//! lock from open to commit, so the read-modify-write of one update never
//! interleaves with another one in the same process. There is no
//! cross-process guarantee.
//!
//! Expiring records are removed by per-key tokio tasks. The tasks live in a
//! registry owned by the storage; [`MemoryStorage::clear`] cancels them all and
//! dropping the last handle to the storage does the same.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{RateLimiterData, Storage, StorageTransaction};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

type Records = Arc<Mutex<HashMap<String, RateLimiterData>>>;

/// In-memory rate limiter storage.
#[derive(Clone)]
pub struct MemoryStorage {
    records: Records,
    evictions: Arc<EvictionRegistry>,
    clock: Arc<dyn Clock>,
}

/// Scheduled deletions, one task per key.
struct EvictionRegistry {
    tasks: SyncMutex<HashMap<String, (u64, JoinHandle<()>)>>,
    next_generation: AtomicU64,
}

impl EvictionRegistry {
    fn new() -> Self {
        Self {
            tasks: SyncMutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    fn cancel(&self, key: &str) {
        if let Some((_, handle)) = self.tasks.lock().remove(key) {
            handle.abort();
        }
    }

    fn cancel_all(&self) {
        for (_, (_, handle)) in self.tasks.lock().drain() {
            handle.abort();
        }
    }

    /// Drop the registry entry for `key` if it still belongs to `generation`.
    fn finished(&self, key: &str, generation: u64) {
        let mut tasks = self.tasks.lock();
        if tasks.get(key).is_some_and(|(g, _)| *g == generation) {
            tasks.remove(key);
        }
    }

    fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Drop for EvictionRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl MemoryStorage {
    /// Create an empty storage on the system clock.
    pub fn new() -> Self {
        Self::with_records(HashMap::new(), Arc::new(SystemClock::new()))
    }

    /// Create an empty storage on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_records(HashMap::new(), clock)
    }

    /// Create a storage seeded with existing records.
    ///
    /// Seeded records are not scheduled for eviction; expired ones are
    /// ignored on read and replaced on the next write.
    pub fn with_records(records: HashMap<String, RateLimiterData>, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
            evictions: Arc::new(EvictionRegistry::new()),
            clock,
        }
    }

    /// Cancel every pending eviction and drop all records.
    pub async fn clear(&self) {
        self.evictions.cancel_all();
        self.records.lock().await.clear();
    }

    /// Number of stored records, expired or not.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether no records are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of scheduled evictions.
    pub fn pending_evictions(&self) -> usize {
        self.evictions.len()
    }

    fn schedule_eviction(&self, key: &str, expiration: DateTime<Utc>) {
        self.evictions.cancel(key);

        let delay = (expiration - self.clock.now())
            .to_std()
            .unwrap_or_default();
        let generation = self.evictions.next_generation.fetch_add(1, Ordering::Relaxed);
        let records = Arc::clone(&self.records);
        let registry: Weak<EvictionRegistry> = Arc::downgrade(&self.evictions);
        let owned_key = key.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut records = records.lock().await;
                if records
                    .get(&owned_key)
                    .is_some_and(|data| data.expiration == Some(expiration))
                {
                    records.remove(&owned_key);
                    debug!(key = %owned_key, "Evicted expired rate limit record");
                }
            }
            if let Some(registry) = registry.upgrade() {
                registry.finished(&owned_key, generation);
            }
        });

        self.evictions
            .tasks
            .lock()
            .insert(key.to_string(), (generation, handle));
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn find(&self, key: &str) -> Result<Option<RateLimiterData>> {
        let records = self.records.lock().await;
        let now = self.clock.now();
        Ok(records
            .get(key)
            .filter(|data| !data.is_expired(now))
            .cloned())
    }

    async fn transaction<'a>(&'a self) -> Result<Box<dyn StorageTransaction + 'a>> {
        let guard = Arc::clone(&self.records).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            storage: self,
            guard,
            pending: HashMap::new(),
        }))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        self.evictions.cancel(key);
        records.remove(key);
        trace!(key = %key, "Removed rate limit record");
        Ok(())
    }
}

/// Writes are staged and only applied on commit.
struct MemoryTransaction<'a> {
    storage: &'a MemoryStorage,
    guard: OwnedMutexGuard<HashMap<String, RateLimiterData>>,
    pending: HashMap<String, RateLimiterData>,
}

#[async_trait]
impl StorageTransaction for MemoryTransaction<'_> {
    async fn find(&mut self, key: &str) -> Result<Option<RateLimiterData>> {
        if let Some(data) = self.pending.get(key) {
            return Ok(Some(data.clone()));
        }
        let now = self.storage.clock.now();
        Ok(self
            .guard
            .get(key)
            .filter(|data| !data.is_expired(now))
            .cloned())
    }

    async fn upsert(&mut self, key: &str, data: RateLimiterData) -> Result<()> {
        self.pending.insert(key.to_string(), data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            storage,
            mut guard,
            pending,
        } = *self;

        for (key, data) in pending {
            match data.expiration {
                Some(expiration) => storage.schedule_eviction(&key, expiration),
                None => storage.evictions.cancel(&key),
            }
            guard.insert(key, data);
        }
        Ok(())
    }
}
