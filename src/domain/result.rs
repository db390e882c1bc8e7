//! The uniform result envelope returned by the orchestrator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Category of a failed execution, for pattern matching without parsing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The context was rejected before any work started
    Validation,
    /// Another execution holds the idempotency key; retry later
    Conflict,
    /// The main logic (or an around hook) failed
    Handler,
    Cancelled,
    Timeout,
    /// No concurrency permit was available
    Overloaded,
    /// The idempotency store failed
    Store,
    /// A result could not be (de)serialized
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Handler => "handler",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Store => "store",
            ErrorKind::Serialization => "serialization",
        }
    }

    /// Whether the same call may succeed if repeated later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Conflict
                | ErrorKind::Handler
                | ErrorKind::Timeout
                | ErrorKind::Overloaded
                | ErrorKind::Store
        )
    }
}

/// Structured error carried in a failed envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Validation violations, empty for other kinds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

/// A suggested next action for the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub title: String,
    pub description: String,
    /// Higher means more relevant
    pub priority: u8,
}

impl Suggestion {
    pub fn new(title: impl Into<String>, description: impl Into<String>, priority: u8) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            priority,
        }
    }
}

/// Timing and identity of one `execute` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub execution_id: Uuid,
    pub duration_ms: u64,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    /// True when the result came from the idempotency cache
    pub replayed: bool,
}

/// Envelope returned by `Orchestrator::execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<ExecutionFailure>,
    pub follow_ups: Vec<Suggestion>,
    pub discoveries: BTreeMap<String, Value>,
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    /// Kind of the failure, if any
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Summary of a past execution, kept for follow-up generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub operation: String,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_result(result: &ExecutionResult) -> Self {
        Self {
            operation: result.metrics.operation.clone(),
            success: result.success,
            error_kind: result.error_kind(),
            duration_ms: result.metrics.duration_ms,
            timestamp: result.metrics.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Conflict.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_failure_serialization_omits_empty_violations() {
        let failure = ExecutionFailure {
            kind: ErrorKind::Conflict,
            message: "busy".to_string(),
            violations: Vec::new(),
        };

        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "conflict");
        assert!(json.get("violations").is_none());
    }
}
