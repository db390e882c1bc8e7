//! Idempotency records and their lifecycle states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of an idempotency key
///
/// `pending -> in_progress -> {completed | failed}`, `failed -> in_progress`
/// on retry. `completed` is terminal until the record expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::InProgress => "in_progress",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }

    /// Whether a new execution may claim a key in this state
    pub fn is_claimable(&self) -> bool {
        matches!(self, IdempotencyStatus::Pending | IdempotencyStatus::Failed)
    }
}

impl Default for IdempotencyStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown idempotency status: {}", other)),
        }
    }
}

/// A persisted idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Key format: "{operation}:{hash16}"
    pub key: String,

    /// Operation name
    pub operation: String,

    pub status: IdempotencyStatus,

    /// Cached result as JSON text (completed records only)
    pub result: Option<String>,

    pub created_at: DateTime<Utc>,

    /// After this instant the record is treated as absent
    pub expires_at: DateTime<Utc>,

    /// Number of failed attempts so far
    pub retry_count: u32,
}

impl IdempotencyRecord {
    /// Check whether the record has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Aggregated counts for one status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusStats {
    pub status: IdempotencyStatus,
    pub count: u64,
    pub avg_retry_count: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            IdempotencyStatus::Pending,
            IdempotencyStatus::InProgress,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<IdempotencyStatus>().unwrap(), status);
        }
        assert!("running".parse::<IdempotencyStatus>().is_err());
    }

    #[test]
    fn test_claimable_states() {
        assert!(IdempotencyStatus::Pending.is_claimable());
        assert!(IdempotencyStatus::Failed.is_claimable());
        assert!(!IdempotencyStatus::InProgress.is_claimable());
        assert!(!IdempotencyStatus::Completed.is_claimable());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let record = IdempotencyRecord {
            key: "op:abc".to_string(),
            operation: "op".to_string(),
            status: IdempotencyStatus::Completed,
            result: None,
            created_at: now - Duration::minutes(10),
            expires_at: now - Duration::seconds(1),
            retry_count: 0,
        };

        assert!(record.is_expired_at(now));
        assert!(!record.is_expired_at(now - Duration::seconds(2)));
    }
}
