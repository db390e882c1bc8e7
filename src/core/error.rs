//! Error taxonomy of the pipeline.
//!
//! Hook failures and exporter failures never appear here: they are logged and
//! recovered where they happen.

use thiserror::Error;

use crate::domain::{ErrorKind, ExecutionFailure};

/// A single reason a context was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextViolation {
    #[error("required field '{0}' is empty")]
    MissingField(&'static str),

    #[error("timestamp is {age_ms}ms old (max {max_age_ms}ms)")]
    Stale { age_ms: i64, max_age_ms: i64 },

    #[error("timestamp is {ahead_ms}ms in the future (tolerance {tolerance_ms}ms)")]
    FutureTimestamp { ahead_ms: i64, tolerance_ms: i64 },
}

/// Failures of the idempotency store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Corrupt record for key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the pipeline to its caller
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("context validation failed: {}", format_violations(.0))]
    Validation(Vec<ContextViolation>),

    #[error("operation already in progress for key {key}; retry later")]
    Conflict { key: String },

    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("operation '{operation}' was cancelled")]
    Cancelled { operation: String },

    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("too many concurrent operations (limit {limit})")]
    Overloaded { limit: usize },

    #[error("idempotency store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_violations(violations: &[ContextViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Conflict { .. } => ErrorKind::Conflict,
            PipelineError::Handler(_) => ErrorKind::Handler,
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::Overloaded { .. } => ErrorKind::Overloaded,
            PipelineError::Store(_) => ErrorKind::Store,
            PipelineError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Convert into the serializable failure carried by the result envelope
    pub fn to_failure(&self) -> ExecutionFailure {
        let violations = match self {
            PipelineError::Validation(v) => v.iter().map(|v| v.to_string()).collect(),
            _ => Vec::new(),
        };

        ExecutionFailure {
            kind: self.kind(),
            message: self.to_string(),
            violations,
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        // Errors that crossed the hook chain keep their pipeline meaning
        match err.downcast::<PipelineError>() {
            Ok(pipeline) => pipeline,
            Err(other) => PipelineError::Handler(other),
        }
    }
}
