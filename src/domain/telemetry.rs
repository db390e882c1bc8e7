//! Spans, alerts and export snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

impl Default for SpanStatus {
    fn default() -> Self {
        Self::Ok
    }
}

/// A timed record of one instrumented execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation: String,
    pub start_time: DateTime<Utc>,
    /// Unset while the span is open
    pub end_time: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
    pub status: SpanStatus,
    pub error: Option<String>,
}

impl TelemetrySpan {
    /// Open a span now. A parent span keeps its trace id when one is supplied.
    pub fn open(
        operation: impl Into<String>,
        trace_id: Option<String>,
        parent_span_id: Option<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            span_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            parent_span_id,
            operation: operation.into(),
            start_time: Utc::now(),
            end_time: None,
            tags: BTreeMap::new(),
            status: SpanStatus::Ok,
            error: None,
        }
    }

    /// Duration in milliseconds, if the span is closed
    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
    }

    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The error threshold was just crossed
    Warning,
    /// The error keeps repeating at twice the threshold or more
    Critical,
}

/// Raised when the same error repeats for an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub message: String,
    pub operation: String,
    pub span_id: String,
    /// Span tags and error details at the time of the alert
    pub context: serde_json::Value,
    /// How often the error was seen in the current window
    pub occurrences: u32,
    pub timestamp: DateTime<Utc>,
}

/// What exporters receive on every span completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSnapshot {
    pub spans: Vec<TelemetrySpan>,
    /// Counter name -> value, e.g. "payment.charge.success"
    pub counters: BTreeMap<String, u64>,
    pub exported_at: DateTime<Utc>,
}

/// Per-operation aggregate over the span buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub count: u64,
    pub avg_duration_ms: f64,
    pub error_rate: f64,
}
