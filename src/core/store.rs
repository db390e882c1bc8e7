//! Persistence backends for idempotency records.
//!
//! The store is the sole arbiter of "who gets to run": `try_claim` moves a key
//! to `in_progress` in one atomic step or reports the record that blocked it.
//! Two backends are provided:
//! - `SqliteIdempotencyStore`: survives restarts, atomic via upsert
//! - `MemoryIdempotencyStore`: process-local, for tests and embedding

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use crate::domain::{IdempotencyRecord, IdempotencyStatus, StatusStats};

use super::error::StoreError;

/// Result of an attempt to claim a key
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller owns the key and must run the handler
    Claimed { retry_count: u32 },
    /// A live record blocked the claim (completed or in progress)
    Existing(IdempotencyRecord),
}

/// Backend for idempotency records
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim `key` for a new execution.
    ///
    /// Succeeds when the key is absent, expired, `pending` or `failed`.
    /// The claimed record is `in_progress` until `now + ttl`.
    async fn try_claim(
        &self,
        key: &str,
        operation: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Read a record, treating expired records as absent
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Mark a key completed with its serialized result
    async fn complete(
        &self,
        key: &str,
        operation: &str,
        result: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Mark a key failed and bump its retry count
    async fn fail(
        &self,
        key: &str,
        operation: &str,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<(), StoreError>;

    /// Physically delete records expired at `now`, returning how many
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Count and average retry count per status over all stored records
    async fn stats(&self) -> Result<Vec<StatusStats>, StoreError>;

    /// Delete a record regardless of state. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// SQLite backend
// ============================================================================

const SCHEMA: &str = "BEGIN;
CREATE TABLE IF NOT EXISTS idempotency_keys (
    key TEXT PRIMARY KEY,
    operation TEXT NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expires_at ON idempotency_keys(expires_at);
COMMIT;";

// The WHERE clause is the conflict arbiter: a live in_progress or completed
// row leaves the statement with zero changes.
const CLAIM_SQL: &str = "INSERT INTO idempotency_keys
    (key, operation, status, result, created_at, expires_at, retry_count)
VALUES (?1, ?2, 'in_progress', NULL, ?3, ?4, 0)
ON CONFLICT(key) DO UPDATE SET
    operation = excluded.operation,
    status = 'in_progress',
    result = NULL,
    created_at = CASE WHEN idempotency_keys.expires_at < ?3 THEN ?3 ELSE idempotency_keys.created_at END,
    retry_count = CASE WHEN idempotency_keys.expires_at < ?3 THEN 0 ELSE idempotency_keys.retry_count END,
    expires_at = excluded.expires_at
WHERE idempotency_keys.expires_at < ?3
   OR idempotency_keys.status IN ('pending', 'failed')";

const COMPLETE_SQL: &str = "INSERT INTO idempotency_keys
    (key, operation, status, result, created_at, expires_at, retry_count)
VALUES (?1, ?2, 'completed', ?3, ?4, ?5, 0)
ON CONFLICT(key) DO UPDATE SET
    operation = excluded.operation,
    status = 'completed',
    result = excluded.result,
    expires_at = excluded.expires_at";

const FAIL_SQL: &str = "INSERT INTO idempotency_keys
    (key, operation, status, result, created_at, expires_at, retry_count)
VALUES (?1, ?2, 'failed', NULL, ?3, ?4, 1)
ON CONFLICT(key) DO UPDATE SET
    operation = excluded.operation,
    status = 'failed',
    result = NULL,
    expires_at = excluded.expires_at,
    retry_count = idempotency_keys.retry_count + 1";

const SELECT_SQL: &str = "SELECT key, operation, status, result, created_at, expires_at, retry_count
FROM idempotency_keys WHERE key = ?1";

/// SQLite-backed store (one connection, serialized through a mutex)
#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIdempotencyStore {
    /// Open or create a database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }
}

fn millis_to_datetime(key: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("timestamp out of range: {}", millis),
    })
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, Option<String>, i64, i64, u32)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn select_record(conn: &Connection, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
    let row = conn
        .query_row(SELECT_SQL, params![key], read_row)
        .optional()?;

    let Some((key, operation, status, result, created_at, expires_at, retry_count)) = row else {
        return Ok(None);
    };

    let status = status
        .parse::<IdempotencyStatus>()
        .map_err(|reason| StoreError::Corrupt {
            key: key.clone(),
            reason,
        })?;

    Ok(Some(IdempotencyRecord {
        created_at: millis_to_datetime(&key, created_at)?,
        expires_at: millis_to_datetime(&key, expires_at)?,
        key,
        operation,
        status,
        result,
        retry_count,
    }))
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn try_claim(
        &self,
        key: &str,
        operation: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let key = key.to_string();
        let operation = operation.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now_ms = now.timestamp_millis();
            let expires_ms = (now + ttl).timestamp_millis();

            let changed = tx.execute(CLAIM_SQL, params![key, operation, now_ms, expires_ms])?;
            let record = select_record(&tx, &key)?;
            tx.commit()?;

            match record {
                Some(record) if changed == 0 => Ok(ClaimOutcome::Existing(record)),
                Some(record) => Ok(ClaimOutcome::Claimed {
                    retry_count: record.retry_count,
                }),
                None => Err(StoreError::Corrupt {
                    key,
                    reason: "record missing after claim".to_string(),
                }),
            }
        })
        .await
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<IdempotencyRecord>, StoreError> {
        let key = key.to_string();
        let record = self.with_conn(move |conn| select_record(conn, &key)).await?;
        Ok(record.filter(|r| !r.is_expired_at(now)))
    }

    async fn complete(
        &self,
        key: &str,
        operation: &str,
        result: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        let operation = operation.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                COMPLETE_SQL,
                params![
                    key,
                    operation,
                    result,
                    now.timestamp_millis(),
                    (now + ttl).timestamp_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn fail(
        &self,
        key: &str,
        operation: &str,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        let operation = operation.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                FAIL_SQL,
                params![
                    key,
                    operation,
                    now.timestamp_millis(),
                    (now + retention).timestamp_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM idempotency_keys WHERE expires_at < ?1",
                params![now.timestamp_millis()],
            )?;
            Ok(deleted)
        })
        .await
    }

    async fn stats(&self) -> Result<Vec<StatusStats>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*), AVG(retry_count)
                 FROM idempotency_keys GROUP BY status ORDER BY status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                ))
            })?;

            let mut stats = Vec::new();
            for row in rows {
                let (status, count, avg) = row?;
                let status = status
                    .parse::<IdempotencyStatus>()
                    .map_err(|reason| StoreError::Corrupt {
                        key: "*".to_string(),
                        reason,
                    })?;
                stats.push(StatusStats {
                    status,
                    count: count.max(0) as u64,
                    avg_retry_count: avg.unwrap_or(0.0),
                });
            }
            Ok(stats)
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM idempotency_keys WHERE key = ?1", params![key])?;
            Ok(deleted > 0)
        })
        .await
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Process-local store with the same semantics as the SQLite backend
#[derive(Debug, Default, Clone)]
pub struct MemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<String, IdempotencyRecord>>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as-is (for seeding and tests)
    pub fn insert(&self, record: IdempotencyRecord) {
        self.records.lock().insert(record.key.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn try_claim(
        &self,
        key: &str,
        operation: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut records = self.records.lock();

        let (created_at, retry_count) = match records.get(key) {
            Some(existing) if existing.is_expired_at(now) => (now, 0),
            Some(existing) if existing.status.is_claimable() => {
                (existing.created_at, existing.retry_count)
            }
            Some(existing) => return Ok(ClaimOutcome::Existing(existing.clone())),
            None => (now, 0),
        };

        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                operation: operation.to_string(),
                status: IdempotencyStatus::InProgress,
                result: None,
                created_at,
                expires_at: now + ttl,
                retry_count,
            },
        );
        debug!(key, retry_count, "Claimed idempotency key");

        Ok(ClaimOutcome::Claimed { retry_count })
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .get(key)
            .filter(|r| !r.is_expired_at(now))
            .cloned())
    }

    async fn complete(
        &self,
        key: &str,
        operation: &str,
        result: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let record = records
            .entry(key.to_string())
            .or_insert_with(|| IdempotencyRecord {
                key: key.to_string(),
                operation: operation.to_string(),
                status: IdempotencyStatus::Pending,
                result: None,
                created_at: now,
                expires_at: now,
                retry_count: 0,
            });
        record.operation = operation.to_string();
        record.status = IdempotencyStatus::Completed;
        record.result = Some(result);
        record.expires_at = now + ttl;
        Ok(())
    }

    async fn fail(
        &self,
        key: &str,
        operation: &str,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let record = records
            .entry(key.to_string())
            .or_insert_with(|| IdempotencyRecord {
                key: key.to_string(),
                operation: operation.to_string(),
                status: IdempotencyStatus::Pending,
                result: None,
                created_at: now,
                expires_at: now,
                retry_count: 0,
            });
        record.operation = operation.to_string();
        record.status = IdempotencyStatus::Failed;
        record.result = None;
        record.expires_at = now + retention;
        record.retry_count += 1;
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.is_expired_at(now));
        Ok(before - records.len())
    }

    async fn stats(&self) -> Result<Vec<StatusStats>, StoreError> {
        let records = self.records.lock();
        let mut grouped: HashMap<IdempotencyStatus, (u64, u64)> = HashMap::new();
        for record in records.values() {
            let entry = grouped.entry(record.status).or_default();
            entry.0 += 1;
            entry.1 += u64::from(record.retry_count);
        }

        let mut stats: Vec<StatusStats> = grouped
            .into_iter()
            .map(|(status, (count, retries))| StatusStats {
                status,
                count,
                avg_retry_count: retries as f64 / count as f64,
            })
            .collect();
        stats.sort_by(|a, b| a.status.as_str().cmp(b.status.as_str()));
        Ok(stats)
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().remove(key).is_some())
    }
}
