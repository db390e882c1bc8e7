//! Interfaces to collaborators outside the pipeline.
//!
//! The pipeline consumes these traits and never depends on what sits behind
//! them. Stock implementations:
//! - `ConsoleExporter`, `FileExporter`: span exporters
//! - `LogAlertSink`: alert channel writing to the log
//! - `ErrorKindFollowUps`: follow-up suggestions keyed on the failure kind

pub mod console;
pub mod file;
pub mod followups;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Alert, ExecutionFailure, ExportSnapshot, HistoryEntry, Suggestion};

pub use console::{ConsoleExporter, LogAlertSink};
pub use file::{FileExporter, FileExporterConfig};
pub use followups::ErrorKindFollowUps;

/// Destination for completed spans and counters
#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Human-readable exporter name
    fn name(&self) -> &str;

    /// Accept one snapshot. Failures are logged by the caller and dropped.
    async fn export(&self, snapshot: &ExportSnapshot) -> Result<()>;

    /// Push out anything buffered
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Channel for alerts raised on repeated errors
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn emit(&self, alert: &Alert) -> Result<()>;
}

/// External knowledge lookup used to enrich successful results
#[async_trait]
pub trait KnowledgeProvider: Send + Sync {
    async fn ask(&self, topic: &str, question: &str) -> Result<String>;
}

/// Everything a follow-up provider may look at
#[derive(Debug, Clone, Copy)]
pub struct FollowUpContext<'a> {
    pub operation: &'a str,
    /// Most recent executions, oldest first
    pub history: &'a [HistoryEntry],
    pub result: Option<&'a Value>,
    pub error: Option<&'a ExecutionFailure>,
}

/// Suggests next actions from recent history and the current outcome
pub trait FollowUpProvider: Send + Sync {
    fn generate(&self, ctx: &FollowUpContext<'_>) -> Vec<Suggestion>;
}
