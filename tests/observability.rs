//! Observability Integration Tests
//!
//! Span export to a JSONL file and alerting on repeated handler errors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use opguard::adapters::{AlertSink, FileExporter, FileExporterConfig, LogAlertSink, SpanExporter};
use opguard::core::{
    MemoryIdempotencyStore, ObservabilityManager, ObservabilitySettings, Orchestrator,
};
use opguard::domain::{Alert, ExportSnapshot, OperationContext, Severity, TelemetrySpan};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn test_spans_are_exported_to_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("spans.jsonl");

    let observability = Arc::new(ObservabilityManager::default());
    let exporter = Arc::new(FileExporter::new(FileExporterConfig::new(&path)));
    observability.add_exporter(exporter.clone());

    let orchestrator = Orchestrator::builder(Arc::new(MemoryIdempotencyStore::new()))
        .observability(observability)
        .build();

    for amount in [10, 20] {
        let ctx = OperationContext::new("merchant-1").with_extension("amount", amount);
        let result = orchestrator
            .execute("payment.charge", ctx, |_| async { Ok(json!("ok")) })
            .await;
        assert!(result.success);
    }

    assert_eq!(exporter.pending().await, 2);
    orchestrator.shutdown().await;
    assert_eq!(exporter.pending().await, 0);

    let content = std::fs::read_to_string(&path).unwrap();
    let spans: Vec<TelemetrySpan> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(spans.len(), 2);
    assert!(spans.iter().all(|s| s.operation == "payment.charge"));
    assert!(spans.iter().all(|s| s.tags.contains_key("idempotency_key")));
    assert_eq!(exporter.name(), "file");
}

#[tokio::test]
async fn test_repeated_errors_raise_alert() {
    let observability = Arc::new(ObservabilityManager::default());
    observability.add_alert_sink(Arc::new(LogAlertSink::new()));

    let orchestrator = Orchestrator::builder(Arc::new(MemoryIdempotencyStore::new()))
        .observability(observability.clone())
        .build();

    for attempt in 0..6 {
        // Failed keys are reclaimable, so the same payload runs every time
        let ctx = OperationContext::new("merchant-1").with_extension("amount", 10);
        let result = orchestrator
            .execute("payment.charge", ctx, |_| async { Err(anyhow!("gateway down")) })
            .await;
        assert!(!result.success);

        let alerts = observability.recent_alerts();
        if attempt < 5 {
            assert!(alerts.is_empty());
        } else {
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0].severity, Severity::Warning);
            assert_eq!(alerts[0].operation, "payment.charge");
            assert_eq!(alerts[0].occurrences, 6);
        }
    }

    let stats = observability.get_span_stats();
    assert_eq!(stats["payment.charge"].count, 6);
    assert!((stats["payment.charge"].error_rate - 1.0).abs() < f64::EPSILON);
}

struct StuckExporter;

#[async_trait]
impl SpanExporter for StuckExporter {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn export(&self, _snapshot: &ExportSnapshot) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

struct StuckSink;

#[async_trait]
impl AlertSink for StuckSink {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn emit(&self, _alert: &Alert) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_stuck_exporter_and_sink_do_not_block_execute() {
    let observability = Arc::new(ObservabilityManager::new(ObservabilitySettings {
        error_alert_threshold: 0,
        delivery_timeout_ms: 50,
        ..Default::default()
    }));
    observability.add_exporter(Arc::new(StuckExporter));
    observability.add_alert_sink(Arc::new(StuckSink));

    let orchestrator = Orchestrator::builder(Arc::new(MemoryIdempotencyStore::new()))
        .observability(observability.clone())
        .build();

    let ok = tokio::time::timeout(
        Duration::from_secs(2),
        orchestrator.execute("op", OperationContext::new("a"), |_| async { Ok(json!(1)) }),
    )
    .await
    .expect("execute blocked on exporter");
    assert!(ok.success);

    let failed = tokio::time::timeout(
        Duration::from_secs(2),
        orchestrator.execute("op", OperationContext::new("b"), |_| async {
            Err(anyhow!("gateway down"))
        }),
    )
    .await
    .expect("execute blocked on alert sink");
    assert!(!failed.success);
    assert_eq!(observability.recent_alerts().len(), 1);

    tokio::time::timeout(Duration::from_secs(2), orchestrator.shutdown())
        .await
        .expect("shutdown blocked on exporter flush");
}
