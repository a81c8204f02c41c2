//! Transactional persistence for rate limiter records.
//!
//! A [`Storage`] keeps one [`RateLimiterData`] per key. All writes go through a
//! [`StorageTransaction`]: a read of the prior record and the write of the
//! next one inside the same transaction are indivisible with respect to any
//! other transaction on the same key. A transaction dropped without
//! [`commit`](StorageTransaction::commit) leaves no trace.

mod database;
mod memory;

pub use database::DatabaseStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Persisted record for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterData {
    /// Serialized policy metrics. Opaque to storage.
    pub state: String,
    /// When the record may be evicted; `None` keeps it forever.
    pub expiration: Option<DateTime<Utc>>,
}

impl RateLimiterData {
    /// Whether the record has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }
}

/// Persistence backend for the storage-backed rate limiter.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a record outside any transaction.
    async fn find(&self, key: &str) -> Result<Option<RateLimiterData>>;

    /// Open a transaction.
    async fn transaction<'a>(&'a self) -> Result<Box<dyn StorageTransaction + 'a>>;

    /// Delete a record outside any transaction.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// The atomicity unit of a [`Storage`].
#[async_trait]
pub trait StorageTransaction: Send {
    /// Read a record, observing this transaction's own writes.
    async fn find(&mut self, key: &str) -> Result<Option<RateLimiterData>>;

    /// Insert or replace a record.
    async fn upsert(&mut self, key: &str, data: RateLimiterData) -> Result<()>;

    /// Make every write visible.
    async fn commit(self: Box<Self>) -> Result<()>;
}
