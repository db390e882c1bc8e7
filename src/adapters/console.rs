//! Log-backed exporter and alert sink.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::domain::{Alert, ExportSnapshot, Severity, SpanStatus};

use super::{AlertSink, SpanExporter};

/// Writes every completed span to the log at info level
#[derive(Debug, Default, Clone)]
pub struct ConsoleExporter;

impl ConsoleExporter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SpanExporter for ConsoleExporter {
    fn name(&self) -> &str {
        "console"
    }

    async fn export(&self, snapshot: &ExportSnapshot) -> Result<()> {
        for span in &snapshot.spans {
            let status = match span.status {
                SpanStatus::Ok => "ok",
                SpanStatus::Error => "error",
            };
            info!(
                operation = %span.operation,
                trace_id = %span.trace_id,
                span_id = %span.span_id,
                duration_ms = span.duration_ms().unwrap_or(0),
                status,
                error = span.error.as_deref().unwrap_or(""),
                "Span completed"
            );
        }
        Ok(())
    }
}

/// Alert channel that logs alerts; critical ones at error level
#[derive(Debug, Default, Clone)]
pub struct LogAlertSink;

impl LogAlertSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn emit(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical => error!(
                operation = %alert.operation,
                span_id = %alert.span_id,
                occurrences = alert.occurrences,
                message = %alert.message,
                "CRITICAL alert"
            ),
            Severity::Warning => warn!(
                operation = %alert.operation,
                span_id = %alert.span_id,
                occurrences = alert.occurrences,
                message = %alert.message,
                "Alert"
            ),
        }
        Ok(())
    }
}
