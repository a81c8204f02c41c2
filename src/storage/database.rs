//! SQL database storage backed by sqlx.
//!
//! Records live in a single table:
//!
//! ```sql
//! CREATE TABLE rate_limiter (
//!     key        TEXT PRIMARY KEY,
//!     state      TEXT NOT NULL,
//!     expiration INTEGER NULL  -- epoch milliseconds
//! );
//! CREATE INDEX rate_limiter_expiration ON rate_limiter (expiration);
//! ```
//!
//! Transactions map onto native database transactions. The first statement a
//! transaction runs against a key is a delete of that key's expired row, which
//! takes the database write lock before the prior state is read; concurrent
//! updates of a key therefore queue behind each other instead of racing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use super::{RateLimiterData, Storage, StorageTransaction};
use crate::clock::{from_millis, Clock, SystemClock};
use crate::error::Result;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS rate_limiter (\
    key TEXT PRIMARY KEY NOT NULL, \
    state TEXT NOT NULL, \
    expiration INTEGER NULL)";

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS rate_limiter_expiration ON rate_limiter (expiration)";

const SELECT_LIVE: &str = "SELECT state, expiration FROM rate_limiter \
    WHERE key = ? AND (expiration IS NULL OR expiration > ?)";

const DELETE_EXPIRED_KEY: &str =
    "DELETE FROM rate_limiter WHERE key = ? AND expiration IS NOT NULL AND expiration <= ?";

const DELETE_EXPIRED: &str =
    "DELETE FROM rate_limiter WHERE expiration IS NOT NULL AND expiration <= ?";

const UPSERT: &str = "INSERT INTO rate_limiter (key, state, expiration) VALUES (?, ?, ?) \
    ON CONFLICT(key) DO UPDATE SET state = excluded.state, expiration = excluded.expiration";

const DELETE_KEY: &str = "DELETE FROM rate_limiter WHERE key = ?";

/// Database-backed rate limiter storage.
#[derive(Clone)]
pub struct DatabaseStorage {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl DatabaseStorage {
    /// Wrap an already-connected pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock::new()))
    }

    /// Wrap an already-connected pool, reading time from `clock`.
    pub fn with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Connect to `url` and create the schema. The database file is created
    /// if missing.
    ///
    /// Every connection to `sqlite::memory:` opens a separate database, so an
    /// in-memory URL gets a pool of one connection that is never recycled.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };
        let pool = pool_options.connect_with(options).await?;
        let storage = Self::new(pool);
        storage.migrate().await?;
        Ok(storage)
    }

    /// Create the table and expiration index if missing.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        info!("Rate limiter schema ready");
        Ok(())
    }

    /// Delete every expired row. Returns how many were removed.
    pub async fn remove_expired(&self) -> Result<u64> {
        let result = sqlx::query(DELETE_EXPIRED)
            .bind(self.clock.now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            debug!(removed, "Purged expired rate limit records");
        }
        Ok(removed)
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn decode_row(row: &SqliteRow) -> Result<RateLimiterData> {
    let state: String = row.try_get("state")?;
    let expiration: Option<i64> = row.try_get("expiration")?;
    Ok(RateLimiterData {
        state,
        expiration: expiration.map(from_millis),
    })
}

fn encode_expiration(expiration: Option<DateTime<Utc>>) -> Option<i64> {
    expiration.map(|at| at.timestamp_millis())
}

#[async_trait]
impl Storage for DatabaseStorage {
    async fn find(&self, key: &str) -> Result<Option<RateLimiterData>> {
        let row = sqlx::query(SELECT_LIVE)
            .bind(key)
            .bind(self.clock.now().timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn transaction<'a>(&'a self) -> Result<Box<dyn StorageTransaction + 'a>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(DatabaseTransaction {
            tx,
            now: self.clock.now().timestamp_millis(),
        }))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query(DELETE_KEY).bind(key).execute(&self.pool).await?;
        Ok(())
    }
}

/// Rolled back by sqlx when dropped uncommitted.
struct DatabaseTransaction {
    tx: Transaction<'static, Sqlite>,
    now: i64,
}

#[async_trait]
impl StorageTransaction for DatabaseTransaction {
    async fn find(&mut self, key: &str) -> Result<Option<RateLimiterData>> {
        sqlx::query(DELETE_EXPIRED_KEY)
            .bind(key)
            .bind(self.now)
            .execute(&mut *self.tx)
            .await?;
        let row = sqlx::query(SELECT_LIVE)
            .bind(key)
            .bind(self.now)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn upsert(&mut self, key: &str, data: RateLimiterData) -> Result<()> {
        sqlx::query(UPSERT)
            .bind(key)
            .bind(data.state)
            .bind(encode_expiration(data.expiration))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn test_storage(clock: ManualClock) -> DatabaseStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let storage = DatabaseStorage::with_clock(pool, Arc::new(clock));
        storage.migrate().await.unwrap();
        storage
    }

    fn data(state: &str, expires_at: Option<i64>) -> RateLimiterData {
        RateLimiterData {
            state: state.to_string(),
            expiration: expires_at.map(from_millis),
        }
    }

    #[tokio::test]
    async fn test_connect_in_memory() {
        let storage = DatabaseStorage::connect("sqlite::memory:").await.unwrap();

        let mut trx = storage.transaction().await.unwrap();
        trx.upsert("k", data("a", None)).await.unwrap();
        trx.commit().await.unwrap();

        assert_eq!(storage.find("k").await.unwrap(), Some(data("a", None)));
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let storage = test_storage(ManualClock::at_millis(0)).await;
        storage.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_and_find() {
        let storage = test_storage(ManualClock::at_millis(0)).await;

        let mut trx = storage.transaction().await.unwrap();
        assert!(trx.find("k").await.unwrap().is_none());
        trx.upsert("k", data("a", Some(1_000))).await.unwrap();
        assert_eq!(trx.find("k").await.unwrap(), Some(data("a", Some(1_000))));
        trx.upsert("k", data("b", None)).await.unwrap();
        trx.commit().await.unwrap();

        assert_eq!(storage.find("k").await.unwrap(), Some(data("b", None)));
    }

    #[tokio::test]
    async fn test_rollback_on_drop() {
        let storage = test_storage(ManualClock::at_millis(0)).await;

        {
            let mut trx = storage.transaction().await.unwrap();
            trx.upsert("k", data("a", Some(1_000))).await.unwrap();
        }

        assert!(storage.find("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_rows() {
        let clock = ManualClock::at_millis(0);
        let storage = test_storage(clock.clone()).await;

        let mut trx = storage.transaction().await.unwrap();
        trx.upsert("short", data("a", Some(500))).await.unwrap();
        trx.upsert("long", data("b", Some(5_000))).await.unwrap();
        trx.upsert("forever", data("c", None)).await.unwrap();
        trx.commit().await.unwrap();

        clock.set_millis(1_000);
        assert!(storage.find("short").await.unwrap().is_none());
        assert!(storage.find("long").await.unwrap().is_some());

        assert_eq!(storage.remove_expired().await.unwrap(), 1);
        assert!(storage.find("forever").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove() {
        let storage = test_storage(ManualClock::at_millis(0)).await;

        let mut trx = storage.transaction().await.unwrap();
        trx.upsert("k", data("a", None)).await.unwrap();
        trx.commit().await.unwrap();

        storage.remove("k").await.unwrap();
        assert!(storage.find("k").await.unwrap().is_none());
    }
}
