//! Domain types for the opguard pipeline.
//!
//! This module contains the core data structures:
//! - Context: the request envelope passed through the pipeline
//! - Hook: typed hooks and their performance records
//! - Idempotency: persisted key records
//! - Telemetry: spans, alerts, export snapshots
//! - Result: the envelope returned to callers

pub mod context;
pub mod hook;
pub mod idempotency;
pub mod result;
pub mod telemetry;

// Re-export commonly used types
pub use context::OperationContext;
pub use hook::{
    AroundHook, BoxFuture, Condition, ContextHook, Hook, HookHandler, HookKind, HookPerformance,
    Next,
};
pub use idempotency::{IdempotencyRecord, IdempotencyStatus, StatusStats};
pub use result::{
    ErrorKind, ExecutionFailure, ExecutionMetrics, ExecutionResult, HistoryEntry, Suggestion,
};
pub use telemetry::{Alert, ExportSnapshot, OperationStats, Severity, SpanStatus, TelemetrySpan};
