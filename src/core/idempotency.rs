//! Idempotent execution on top of an `IdempotencyStore`.
//!
//! State machine per key:
//! `pending -> in_progress -> {completed | failed}`, `failed -> in_progress`
//! on retry, `completed` answers from cache until it expires, and a second
//! claim of an `in_progress` key fails fast with a conflict.

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{IdempotencyRecord, IdempotencyStatus, OperationContext, StatusStats};

use super::error::{PipelineError, StoreError};
use super::store::{ClaimOutcome, IdempotencyStore};

/// TTLs and cleanup cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencySettings {
    /// Lifetime of in-progress and completed records in seconds (default: 300)
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: i64,

    /// Retention of failed records in seconds (default: 3600)
    #[serde(default = "default_failed_ttl_seconds")]
    pub failed_ttl_seconds: i64,

    /// Interval of the background cleanup in seconds (default: 3600)
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

fn default_ttl_seconds() -> i64 {
    300
}
fn default_failed_ttl_seconds() -> i64 {
    3600
}
fn default_cleanup_interval_seconds() -> u64 {
    3600
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            failed_ttl_seconds: default_failed_ttl_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

impl IdempotencySettings {
    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_seconds)
    }

    pub fn failed_ttl(&self) -> Duration {
        Duration::seconds(self.failed_ttl_seconds)
    }
}

/// A value produced under an idempotency key
#[derive(Debug, Clone, PartialEq)]
pub struct Idempotent<T> {
    pub value: T,
    /// True when served from a completed record instead of running the handler
    pub replayed: bool,
}

/// Canonical fields that identify a logical operation instance
#[derive(Serialize)]
struct KeyMaterial<'a> {
    operation: &'a str,
    subject_id: &'a str,
    extensions: &'a std::collections::BTreeMap<String, serde_json::Value>,
}

/// Generate the idempotency key for an operation invocation.
///
/// The request id and timestamp are excluded: a retry with a fresh request id
/// but the same subject and payload maps to the same key.
pub fn generate_key(operation: &str, ctx: &OperationContext) -> String {
    let material = KeyMaterial {
        operation,
        subject_id: &ctx.subject_id,
        extensions: &ctx.extensions,
    };
    // BTreeMap keys serialize in order, so this is canonical
    let canonical = serde_json::to_string(&material).unwrap_or_default();
    format!("{}:{}", operation, hash_input(&canonical))
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// Runs handlers at most once per key
#[derive(Clone)]
pub struct IdempotencyManager {
    store: Arc<dyn IdempotencyStore>,
    settings: IdempotencySettings,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn IdempotencyStore>, settings: IdempotencySettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &IdempotencySettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Run `handler` unless `key` already has a live outcome.
    ///
    /// - completed: the cached result is returned, the handler is not called
    /// - in progress: `PipelineError::Conflict`
    /// - absent, pending, failed or expired: the handler runs; success is
    ///   cached for `ttl`, failure is kept for the failed-record retention
    ///   with an incremented retry count and the error is returned unchanged
    pub async fn execute_with_idempotency<T, F, Fut>(
        &self,
        key: &str,
        operation: &str,
        ttl: Duration,
        handler: F,
    ) -> Result<Idempotent<T>, PipelineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let now = Utc::now();

        let retry_count = match self.store.try_claim(key, operation, now, ttl).await? {
            ClaimOutcome::Claimed { retry_count } => retry_count,
            ClaimOutcome::Existing(record) => return self.resolve_existing(record),
        };

        debug!(key, operation, retry_count, "Idempotency key claimed");

        match handler().await {
            Ok(value) => {
                let serialized = serde_json::to_string(&value)?;
                self.store
                    .complete(key, operation, serialized, Utc::now(), ttl)
                    .await?;
                Ok(Idempotent {
                    value,
                    replayed: false,
                })
            }
            Err(err) => {
                // The original error wins over a bookkeeping failure
                if let Err(store_err) = self
                    .store
                    .fail(key, operation, Utc::now(), self.settings.failed_ttl())
                    .await
                {
                    warn!(key, error = %store_err, "Failed to record idempotency failure");
                }
                Err(err)
            }
        }
    }

    fn resolve_existing<T: DeserializeOwned>(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Idempotent<T>, PipelineError> {
        match (record.status, record.result) {
            (IdempotencyStatus::Completed, Some(cached)) => {
                debug!(key = %record.key, "Returning cached result");
                let value = serde_json::from_str(&cached)?;
                Ok(Idempotent {
                    value,
                    replayed: true,
                })
            }
            (IdempotencyStatus::Completed, None) => Err(StoreError::Corrupt {
                key: record.key,
                reason: "completed record without result".to_string(),
            }
            .into()),
            _ => Err(PipelineError::Conflict { key: record.key }),
        }
    }

    /// Read a live record
    pub async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.store.get(key, Utc::now()).await
    }

    /// Release a key regardless of its state (operator action for stuck keys)
    pub async fn clear(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.store.remove(key).await?;
        if removed {
            info!(key, "Idempotency key cleared");
        }
        Ok(removed)
    }

    /// Delete all expired records
    pub async fn cleanup_expired_keys(&self) -> Result<usize, StoreError> {
        let deleted = self.store.delete_expired(Utc::now()).await?;
        if deleted > 0 {
            info!(deleted, "Cleaned up expired idempotency keys");
        }
        Ok(deleted)
    }

    /// Counts and average retry counts grouped by status
    pub async fn get_stats(&self) -> Result<Vec<StatusStats>, StoreError> {
        self.store.stats().await
    }

    /// Run `cleanup_expired_keys` on a timer until `cancel` fires
    pub fn spawn_cleanup(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let period = std::time::Duration::from_secs(self.settings.cleanup_interval_seconds.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Idempotency cleanup stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = manager.cleanup_expired_keys().await {
                            warn!(error = %e, "Idempotency cleanup failed");
                        }
                    }
                }
            }
        })
    }
}
