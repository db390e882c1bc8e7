//! Batched JSONL span exporter.
//!
//! Spans are buffered in memory and appended to the file as one JSON object
//! per line, either when the batch fills or when a flush is requested.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{ExportSnapshot, TelemetrySpan};

use super::SpanExporter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileExporterConfig {
    /// Target file; parent directories are created on first write
    pub path: PathBuf,

    /// Buffered spans that trigger a write (default: 100)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

impl FileExporterConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            batch_size: default_batch_size(),
        }
    }
}

pub struct FileExporter {
    config: FileExporterConfig,
    buffer: Mutex<Vec<TelemetrySpan>>,
}

impl FileExporter {
    pub fn new(config: FileExporterConfig) -> Self {
        Self {
            config,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of spans waiting for the next write
    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    async fn write_batch(&self, spans: &[TelemetrySpan]) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let mut lines = String::new();
        for span in spans {
            lines.push_str(&serde_json::to_string(span).context("Failed to serialize span")?);
            lines.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .await
            .with_context(|| format!("Failed to open span file: {}", self.config.path.display()))?;

        file.write_all(lines.as_bytes())
            .await
            .context("Failed to write spans")?;
        file.flush().await.context("Failed to flush spans")?;

        debug!(spans = spans.len(), path = %self.config.path.display(), "Spans written");
        Ok(())
    }

    /// Flush on a timer until `cancel` fires, then flush once more
    pub fn spawn_flush(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush().await {
                            warn!(error = %e, "Periodic span flush failed");
                        }
                    }
                }
            }

            if let Err(e) = self.flush().await {
                warn!(error = %e, "Final span flush failed");
            }
        })
    }
}

#[async_trait]
impl SpanExporter for FileExporter {
    fn name(&self) -> &str {
        "file"
    }

    async fn export(&self, snapshot: &ExportSnapshot) -> Result<()> {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            buffer.extend(snapshot.spans.iter().cloned());
            if buffer.len() < self.config.batch_size.max(1) {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        self.write_batch(&batch).await
    }

    async fn flush(&self) -> Result<()> {
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        self.write_batch(&batch).await
    }
}
