//! Spans, counters, exporters and error alerting.
//!
//! Every instrumented execution produces one span. Completed spans stay in a
//! bounded ring buffer for local statistics and are pushed, together with a
//! counter snapshot, to all registered exporters. Repeated errors of the same
//! kind on the same operation raise alerts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::adapters::{AlertSink, SpanExporter};
use crate::domain::{Alert, ExportSnapshot, OperationStats, Severity, SpanStatus, TelemetrySpan};

use super::error::PipelineError;

/// Buffer sizes and alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySettings {
    /// Spans kept in memory (default: 1000)
    #[serde(default = "default_span_buffer")]
    pub span_buffer: usize,

    /// Duration above which a span is tagged `slow` (default: 100ms)
    #[serde(default = "default_slow_span_ms")]
    pub slow_span_ms: u64,

    /// Errors per operation and message tolerated within a window (default: 5)
    #[serde(default = "default_error_alert_threshold")]
    pub error_alert_threshold: u32,

    /// Length of the error counting window in seconds (default: 300)
    #[serde(default = "default_alert_window_seconds")]
    pub alert_window_seconds: i64,

    /// Alerts kept for `recent_alerts` (default: 100)
    #[serde(default = "default_alert_history")]
    pub alert_history: usize,

    /// Budget of each exporter or alert sink call (default: 1000ms)
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

fn default_span_buffer() -> usize {
    1000
}
fn default_slow_span_ms() -> u64 {
    100
}
fn default_error_alert_threshold() -> u32 {
    5
}
fn default_alert_window_seconds() -> i64 {
    300
}
fn default_alert_history() -> usize {
    100
}
fn default_delivery_timeout_ms() -> u64 {
    1000
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            span_buffer: default_span_buffer(),
            slow_span_ms: default_slow_span_ms(),
            error_alert_threshold: default_error_alert_threshold(),
            alert_window_seconds: default_alert_window_seconds(),
            alert_history: default_alert_history(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

/// Caller-supplied span attributes
#[derive(Debug, Clone, Default)]
pub struct SpanMetadata {
    pub tags: BTreeMap<String, String>,
    pub parent_span_id: Option<String>,
    /// Joins an existing trace instead of starting a new one
    pub trace_id: Option<String>,
}

impl SpanMetadata {
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Identity of the span an instrumented handler runs in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
}

#[derive(Debug)]
struct ErrorWindow {
    started: DateTime<Utc>,
    count: u32,
}

pub struct ObservabilityManager {
    settings: ObservabilitySettings,
    spans: Mutex<VecDeque<TelemetrySpan>>,
    counters: Mutex<BTreeMap<String, u64>>,
    error_windows: Mutex<HashMap<(String, String), ErrorWindow>>,
    alerts: Mutex<VecDeque<Alert>>,
    exporters: RwLock<Vec<Arc<dyn SpanExporter>>>,
    alert_sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
}

impl Default for ObservabilityManager {
    fn default() -> Self {
        Self::new(ObservabilitySettings::default())
    }
}

impl ObservabilityManager {
    pub fn new(settings: ObservabilitySettings) -> Self {
        Self {
            settings,
            spans: Mutex::new(VecDeque::new()),
            counters: Mutex::new(BTreeMap::new()),
            error_windows: Mutex::new(HashMap::new()),
            alerts: Mutex::new(VecDeque::new()),
            exporters: RwLock::new(Vec::new()),
            alert_sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &ObservabilitySettings {
        &self.settings
    }

    pub fn add_exporter(&self, exporter: Arc<dyn SpanExporter>) {
        debug!(exporter = exporter.name(), "Span exporter registered");
        self.exporters.write().push(exporter);
    }

    pub fn add_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        debug!(sink = sink.name(), "Alert sink registered");
        self.alert_sinks.write().push(sink);
    }

    /// Open a span and append it to the buffer, evicting the oldest past capacity
    pub fn create_span(&self, operation: &str, metadata: &SpanMetadata) -> TelemetrySpan {
        let mut span = TelemetrySpan::open(
            operation,
            metadata.trace_id.clone(),
            metadata.parent_span_id.clone(),
        );
        span.tags = metadata.tags.clone();

        let mut spans = self.spans.lock();
        spans.push_back(span.clone());
        while spans.len() > self.settings.span_buffer.max(1) {
            spans.pop_front();
        }
        span
    }

    /// Run `handler` inside a new span and record its outcome.
    ///
    /// The outcome is returned unchanged; exporter and alert sink failures and
    /// timeouts are only logged.
    pub async fn instrument<T, F, Fut>(
        &self,
        operation: &str,
        metadata: SpanMetadata,
        handler: F,
    ) -> Result<T, PipelineError>
    where
        F: FnOnce(SpanContext) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut span = self.create_span(operation, &metadata);
        let started = Instant::now();

        let outcome = handler(SpanContext {
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        span.end_time = Some(span.start_time + Duration::milliseconds(elapsed_ms as i64));

        let alert = match &outcome {
            Ok(_) => {
                span.tags.insert("result".to_string(), "success".to_string());
                if elapsed_ms > self.settings.slow_span_ms {
                    span.tags.insert("slow".to_string(), "true".to_string());
                }
                self.increment(&format!("{}.success", operation));
                None
            }
            Err(err) => {
                let message = err.to_string();
                span.status = SpanStatus::Error;
                span.error = Some(message.clone());
                span.tags.insert("result".to_string(), "error".to_string());
                span.tags
                    .insert("error_kind".to_string(), err.kind().as_str().to_string());
                self.increment(&format!("{}.error", operation));
                self.increment(&format!("{}.error.{}", operation, err.kind().as_str()));
                self.track_error(&span, &message)
            }
        };

        self.store_completed(&span);
        debug!(
            operation,
            span_id = %span.span_id,
            duration_ms = elapsed_ms,
            status = ?span.status,
            "Span closed"
        );

        self.export(&span).await;
        if let Some(alert) = alert {
            self.dispatch_alert(alert).await;
        }

        outcome
    }

    /// Replace the open copy of a span in the buffer with its completed form
    fn store_completed(&self, span: &TelemetrySpan) {
        let mut spans = self.spans.lock();
        if let Some(slot) = spans.iter_mut().rev().find(|s| s.span_id == span.span_id) {
            *slot = span.clone();
        }
    }

    /// Count an error and build an alert once the window threshold is exceeded
    fn track_error(&self, span: &TelemetrySpan, message: &str) -> Option<Alert> {
        let now = Utc::now();
        let window = Duration::seconds(self.settings.alert_window_seconds);
        let threshold = self.settings.error_alert_threshold;

        let count = {
            let mut windows = self.error_windows.lock();
            windows.retain(|_, w| now - w.started <= window);
            let entry = windows
                .entry((span.operation.clone(), message.to_string()))
                .or_insert(ErrorWindow {
                    started: now,
                    count: 0,
                });
            if now - entry.started > window {
                entry.started = now;
                entry.count = 0;
            }
            entry.count += 1;
            entry.count
        };

        if count <= threshold {
            return None;
        }

        let severity = if count >= threshold.saturating_mul(2) {
            Severity::Critical
        } else {
            Severity::Warning
        };

        Some(Alert {
            severity,
            message: format!(
                "{} failed {} times in {}s: {}",
                span.operation, count, self.settings.alert_window_seconds, message
            ),
            operation: span.operation.clone(),
            span_id: span.span_id.clone(),
            context: json!({
                "trace_id": span.trace_id,
                "tags": span.tags,
                "error": message,
            }),
            occurrences: count,
            timestamp: now,
        })
    }

    async fn dispatch_alert(&self, alert: Alert) {
        {
            let mut alerts = self.alerts.lock();
            alerts.push_back(alert.clone());
            while alerts.len() > self.settings.alert_history.max(1) {
                alerts.pop_front();
            }
        }

        let sinks: Vec<Arc<dyn AlertSink>> = self.alert_sinks.read().clone();
        if sinks.is_empty() {
            warn!(operation = %alert.operation, message = %alert.message, "Alert raised");
            return;
        }

        let budget = self.delivery_timeout();
        let results = join_all(
            sinks
                .iter()
                .map(|sink| tokio::time::timeout(budget, sink.emit(&alert))),
        )
        .await;
        for (sink, result) in sinks.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(sink = sink.name(), error = %e, "Alert sink failed"),
                Err(_) => warn!(sink = sink.name(), "Alert sink timed out"),
            }
        }
    }

    async fn export(&self, span: &TelemetrySpan) {
        let exporters: Vec<Arc<dyn SpanExporter>> = self.exporters.read().clone();
        if exporters.is_empty() {
            return;
        }

        let snapshot = ExportSnapshot {
            spans: vec![span.clone()],
            counters: self.counters(),
            exported_at: Utc::now(),
        };

        let budget = self.delivery_timeout();
        let results = join_all(
            exporters
                .iter()
                .map(|e| tokio::time::timeout(budget, e.export(&snapshot))),
        )
        .await;
        for (exporter, result) in exporters.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(exporter = exporter.name(), error = %e, "Span export failed"),
                Err(_) => warn!(exporter = exporter.name(), "Span export timed out"),
            }
        }
    }

    fn delivery_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.settings.delivery_timeout_ms)
    }

    /// Flush every exporter, logging failures
    pub async fn flush_exporters(&self) {
        let exporters: Vec<Arc<dyn SpanExporter>> = self.exporters.read().clone();
        let budget = self.delivery_timeout();
        let results = join_all(
            exporters
                .iter()
                .map(|e| tokio::time::timeout(budget, e.flush())),
        )
        .await;
        for (exporter, result) in exporters.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(exporter = exporter.name(), error = %e, "Exporter flush failed"),
                Err(_) => warn!(exporter = exporter.name(), "Exporter flush timed out"),
            }
        }
    }

    /// Add one to a named counter
    pub fn increment(&self, counter: &str) {
        *self.counters.lock().entry(counter.to_string()).or_insert(0) += 1;
    }

    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }

    /// Buffered spans, oldest first
    pub fn spans(&self) -> Vec<TelemetrySpan> {
        self.spans.lock().iter().cloned().collect()
    }

    /// Alerts raised so far, oldest first
    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    /// Call count, average duration and error rate per operation over closed buffered spans
    pub fn get_span_stats(&self) -> BTreeMap<String, OperationStats> {
        let mut totals: BTreeMap<String, (u64, u64, u64)> = BTreeMap::new();
        for span in self.spans.lock().iter() {
            let Some(duration) = span.duration_ms() else {
                continue;
            };
            let entry = totals.entry(span.operation.clone()).or_default();
            entry.0 += 1;
            entry.1 += duration;
            if span.status == SpanStatus::Error {
                entry.2 += 1;
            }
        }

        totals
            .into_iter()
            .map(|(operation, (count, total_ms, errors))| {
                let stats = OperationStats {
                    count,
                    avg_duration_ms: total_ms as f64 / count as f64,
                    error_rate: errors as f64 / count as f64,
                };
                (operation, stats)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingExporter {
        snapshots: Mutex<Vec<ExportSnapshot>>,
    }

    #[async_trait]
    impl SpanExporter for RecordingExporter {
        fn name(&self) -> &str {
            "recording"
        }

        async fn export(&self, snapshot: &ExportSnapshot) -> anyhow::Result<()> {
            self.snapshots.lock().push(snapshot.clone());
            Ok(())
        }
    }

    struct BrokenExporter;

    #[async_trait]
    impl SpanExporter for BrokenExporter {
        fn name(&self) -> &str {
            "broken"
        }

        async fn export(&self, _snapshot: &ExportSnapshot) -> anyhow::Result<()> {
            anyhow::bail!("collector unreachable")
        }
    }

    fn failing() -> Result<(), PipelineError> {
        Err(PipelineError::Handler(anyhow::anyhow!("card declined")))
    }

    #[tokio::test]
    async fn test_success_span_and_counters() {
        let manager = ObservabilityManager::default();
        let metadata = SpanMetadata::default().tag("subject_id", "m1");

        let value = manager
            .instrument("payment.charge", metadata, |span| async move {
                assert_eq!(span.span_id.len(), 16);
                Ok::<_, PipelineError>(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let spans = manager.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].is_closed());
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(spans[0].tags["result"], "success");
        assert_eq!(spans[0].tags["subject_id"], "m1");
        assert_eq!(manager.counters()["payment.charge.success"], 1);
    }

    #[tokio::test]
    async fn test_slow_span_is_tagged() {
        let manager = ObservabilityManager::new(ObservabilitySettings {
            slow_span_ms: 10,
            ..Default::default()
        });

        manager
            .instrument("op", SpanMetadata::default(), |_| async {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                Ok::<_, PipelineError>(())
            })
            .await
            .unwrap();

        assert_eq!(manager.spans()[0].tags.get("slow").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_error_span_records_kind() {
        let manager = ObservabilityManager::default();

        let result = manager
            .instrument("op", SpanMetadata::default(), |_| async { failing() })
            .await;
        assert!(result.is_err());

        let span = &manager.spans()[0];
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.tags["error_kind"], "handler");
        assert_eq!(span.error.as_deref(), Some("handler failed: card declined"));

        let counters = manager.counters();
        assert_eq!(counters["op.error"], 1);
        assert_eq!(counters["op.error.handler"], 1);
    }

    #[tokio::test]
    async fn test_alert_after_threshold() {
        let manager = ObservabilityManager::default();

        for _ in 0..5 {
            let _ = manager
                .instrument("op", SpanMetadata::default(), |_| async { failing() })
                .await;
        }
        assert!(manager.recent_alerts().is_empty());

        let _ = manager
            .instrument("op", SpanMetadata::default(), |_| async { failing() })
            .await;
        let alerts = manager.recent_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].occurrences, 6);
        assert_eq!(alerts[0].operation, "op");

        for _ in 0..4 {
            let _ = manager
                .instrument("op", SpanMetadata::default(), |_| async { failing() })
                .await;
        }
        let last = manager.recent_alerts().pop().unwrap();
        assert_eq!(last.severity, Severity::Critical);
        assert_eq!(last.occurrences, 10);
    }

    #[tokio::test]
    async fn test_expired_error_windows_are_dropped() {
        let manager = ObservabilityManager::new(ObservabilitySettings {
            alert_window_seconds: 0,
            ..Default::default()
        });

        for i in 0..50 {
            let _ = manager
                .instrument("payment.charge", SpanMetadata::default(), |_| async move {
                    Err::<(), _>(PipelineError::Handler(anyhow::anyhow!("declined txn {}", i)))
                })
                .await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert!(manager.error_windows.lock().len() <= 1);
        assert!(manager.recent_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_live_error_windows_are_kept() {
        let manager = ObservabilityManager::default();

        for i in 0..3 {
            let _ = manager
                .instrument("op", SpanMetadata::default(), |_| async move {
                    Err::<(), _>(PipelineError::Handler(anyhow::anyhow!("declined txn {}", i)))
                })
                .await;
        }

        assert_eq!(manager.error_windows.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let manager = ObservabilityManager::new(ObservabilitySettings {
            span_buffer: 3,
            ..Default::default()
        });

        for i in 0..5 {
            manager.create_span(&format!("op{}", i), &SpanMetadata::default());
        }

        let operations: Vec<String> = manager.spans().into_iter().map(|s| s.operation).collect();
        assert_eq!(operations, vec!["op2", "op3", "op4"]);
    }

    #[tokio::test]
    async fn test_exporters_receive_snapshot_and_failures_are_ignored() {
        let manager = ObservabilityManager::default();
        let recording = Arc::new(RecordingExporter::default());
        manager.add_exporter(recording.clone());
        manager.add_exporter(Arc::new(BrokenExporter));

        manager
            .instrument("op", SpanMetadata::default(), |_| async { Ok::<_, PipelineError>(()) })
            .await
            .unwrap();

        let snapshots = recording.snapshots.lock();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].spans[0].operation, "op");
        assert_eq!(snapshots[0].counters["op.success"], 1);
    }

    #[tokio::test]
    async fn test_span_stats() {
        let manager = ObservabilityManager::default();
        manager
            .instrument("op", SpanMetadata::default(), |_| async { Ok::<_, PipelineError>(()) })
            .await
            .unwrap();
        let _ = manager
            .instrument("op", SpanMetadata::default(), |_| async { failing() })
            .await;

        let stats = manager.get_span_stats();
        assert_eq!(stats["op"].count, 2);
        assert!((stats["op"].error_rate - 0.5).abs() < f64::EPSILON);
    }
}
