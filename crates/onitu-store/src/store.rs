//! SQLite-backed key-value store with range scans and write batches
//!
//! A single `kv(key TEXT PRIMARY KEY, value TEXT)` table holds every
//! namespace; values are JSON. SQLite gives us the properties the rest of
//! the system leans on: total, stable key ordering across restarts, atomic
//! multi-key transactions, and consistent reader snapshots at transaction
//! boundaries.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::StoreError;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

/// Shared handle to the session's metadata store.
///
/// Cheap to clone; all clones share the same pool and closed flag.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    closed: Arc<AtomicBool>,
}

impl Store {
    /// Opens (creating if necessary) the store at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        info!(path = %path.display(), "Metadata store opened");

        Ok(Self {
            pool,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Opens an in-memory store (tests).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?;

        // One connection only: each :memory: connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self {
            pool,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// True once [`close`](Store::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Begins teardown: every subsequent call fails with
    /// [`StoreError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close().await;
        info!("Metadata store closed");
    }

    /// Reads and deserializes a value, `None` when the key is absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_value(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("key '{key}': {e}"))),
            None => Ok(None),
        }
    }

    /// Reads the raw JSON value under a key.
    pub async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.ensure_open()?;
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.get("value");
                serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| StoreError::Serialization(format!("key '{key}': {e}")))
            }
            None => Ok(None),
        }
    }

    /// Serializes and writes a value under a key, replacing any previous one.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.ensure_open()?;
        let raw = serde_json::to_string(value)
            .map_err(|e| StoreError::Serialization(format!("key '{key}': {e}")))?;
        sqlx::query("INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(raw)
            .execute(&self.pool)
            .await?;
        debug!(key, "Store put");
        Ok(())
    }

    /// Deletes a key; absent keys are a no-op.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        debug!(key, "Store delete");
        Ok(())
    }

    /// True when the key is present.
    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let row = sqlx::query("SELECT 1 FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Scans every `(key, value)` pair under a prefix, in lexicographic key
    /// order.
    pub async fn range(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        self.ensure_open()?;
        let rows = match prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")
                    .bind(prefix)
                    .bind(upper)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")
                    .bind(prefix)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let raw: String = row.get("value");
            let value = serde_json::from_str(&raw)
                .map_err(|e| StoreError::Serialization(format!("key '{key}': {e}")))?;
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Scans only the keys under a prefix, in lexicographic order.
    pub async fn range_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        let rows = match prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query("SELECT key FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")
                    .bind(prefix)
                    .bind(upper)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT key FROM kv WHERE key >= ?1 ORDER BY key")
                    .bind(prefix)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(|row| row.get("key")).collect())
    }

    /// Starts an atomic write batch.
    ///
    /// Mutations accumulate in memory and hit the database in a single
    /// transaction on [`commit`](WriteBatch::commit); dropping an
    /// uncommitted batch discards it, so release is guaranteed on every
    /// exit path.
    #[must_use]
    pub fn batch(&self) -> WriteBatch {
        WriteBatch {
            store: self.clone(),
            ops: Vec::new(),
        }
    }
}

/// Exclusive upper bound for a prefix scan: the prefix with its last code
/// point incremented. UTF-8 preserves code-point order under byte-wise
/// comparison, which is what SQLite's BINARY collation uses. `None` means
/// "no upper bound" (empty prefix).
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        if next == 0xD800 {
            // skip the surrogate gap
            next = 0xE000;
        }
        if let Some(c) = char::from_u32(next) {
            chars.push(c);
            return Some(chars.into_iter().collect());
        }
        // last was char::MAX, carry into the previous position
    }
    None
}

/// Accumulated mutations applied atomically on commit.
pub struct WriteBatch {
    store: Store,
    ops: Vec<BatchOp>,
}

enum BatchOp {
    Put(String, String),
    Delete(String),
}

impl WriteBatch {
    /// Queues a serialized put.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| StoreError::Serialization(format!("key '{key}': {e}")))?;
        self.ops.push(BatchOp::Put(key.to_string(), raw));
        Ok(())
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: &str) {
        self.ops.push(BatchOp::Delete(key.to_string()));
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing has been queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies every queued operation in one transaction.
    pub async fn commit(self) -> Result<(), StoreError> {
        self.store.ensure_open()?;
        if self.ops.is_empty() {
            return Ok(());
        }

        let mut tx = self.store.pool.begin().await?;
        for op in &self.ops {
            match op {
                BatchOp::Put(key, raw) => {
                    sqlx::query("INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
                        .bind(key)
                        .bind(raw)
                        .execute(&mut *tx)
                        .await?;
                }
                BatchOp::Delete(key) => {
                    sqlx::query("DELETE FROM kv WHERE key = ?1")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        debug!(ops = self.ops.len(), "Write batch committed");
        Ok(())
    }
}
