//! Orchestrator: the single entry point of the pipeline.
//!
//! # Execution Flow
//! ```text
//! validate -> permit -> idempotency key -> execute_with_idempotency {
//!     instrument {
//!         execute_with_hooks(handler) raced against cancel + timeout
//!     }
//! } -> enrichment -> ExecutionResult
//! ```
//!
//! `execute` never returns an error: every failure ends up in the envelope
//! with a typed `ErrorKind`.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    FileExporter, FileExporterConfig, FollowUpContext, FollowUpProvider, KnowledgeProvider,
};
use crate::config::Config;
use crate::domain::{
    ExecutionFailure, ExecutionMetrics, ExecutionResult, HistoryEntry, OperationContext,
    Suggestion,
};

use super::error::{ContextViolation, PipelineError};
use super::hooks::HookRegistry;
use super::idempotency::{generate_key, IdempotencyManager, IdempotencySettings, Idempotent};
use super::observability::{ObservabilityManager, SpanMetadata};
use super::store::IdempotencyStore;
use super::validator::{ContextValidator, ValidationSettings};

/// Limits of the orchestrator itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Calls allowed in flight before new ones are rejected (default: 1000)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Budget of the hook pipeline per call (default: 30000ms)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Budget of each enrichment step (default: 2000ms)
    #[serde(default = "default_enrichment_timeout_ms")]
    pub enrichment_timeout_ms: u64,

    /// Recent executions remembered for follow-up generation (default: 50)
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_max_concurrent() -> usize {
    1000
}
fn default_operation_timeout_ms() -> u64 {
    30_000
}
fn default_enrichment_timeout_ms() -> u64 {
    2_000
}
fn default_history_size() -> usize {
    50
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            operation_timeout_ms: default_operation_timeout_ms(),
            enrichment_timeout_ms: default_enrichment_timeout_ms(),
            history_size: default_history_size(),
        }
    }
}

/// Assembles an `Orchestrator` from its parts
pub struct OrchestratorBuilder {
    store: Arc<dyn IdempotencyStore>,
    settings: OrchestratorSettings,
    validation: ValidationSettings,
    idempotency: IdempotencySettings,
    hooks: Option<HookRegistry>,
    observability: Option<Arc<ObservabilityManager>>,
    knowledge: Option<Arc<dyn KnowledgeProvider>>,
    follow_ups: Option<Arc<dyn FollowUpProvider>>,
}

impl OrchestratorBuilder {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            settings: OrchestratorSettings::default(),
            validation: ValidationSettings::default(),
            idempotency: IdempotencySettings::default(),
            hooks: None,
            observability: None,
            knowledge: None,
            follow_ups: None,
        }
    }

    /// Take every settings section from a loaded config.
    ///
    /// Hook and observability settings apply only when no registry or
    /// manager is supplied explicitly. A configured spans file gets a
    /// `FileExporter` on the manager built here.
    pub fn config(mut self, config: &Config) -> Self {
        self.settings = config.orchestrator.clone();
        self.validation = config.validation.clone();
        self.idempotency = config.idempotency.clone();
        if self.hooks.is_none() {
            self.hooks = Some(HookRegistry::new(config.hooks.clone()));
        }
        if self.observability.is_none() {
            let observability = ObservabilityManager::new(config.observability.clone());
            if let Some(path) = &config.spans_file {
                debug!(path = %path.display(), "Exporting spans to file");
                observability.add_exporter(Arc::new(FileExporter::new(FileExporterConfig::new(
                    path,
                ))));
            }
            self.observability = Some(Arc::new(observability));
        }
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn validation(mut self, settings: ValidationSettings) -> Self {
        self.validation = settings;
        self
    }

    pub fn idempotency(mut self, settings: IdempotencySettings) -> Self {
        self.idempotency = settings;
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn observability(mut self, observability: Arc<ObservabilityManager>) -> Self {
        self.observability = Some(observability);
        self
    }

    pub fn knowledge(mut self, provider: Arc<dyn KnowledgeProvider>) -> Self {
        self.knowledge = Some(provider);
        self
    }

    pub fn follow_ups(mut self, provider: Arc<dyn FollowUpProvider>) -> Self {
        self.follow_ups = Some(provider);
        self
    }

    pub fn build(self) -> Orchestrator {
        let limit = self.settings.max_concurrent.max(1);
        Orchestrator {
            validator: ContextValidator::new(self.validation),
            idempotency: IdempotencyManager::new(self.store, self.idempotency),
            hooks: self.hooks.unwrap_or_default(),
            observability: self.observability.unwrap_or_default(),
            knowledge: self.knowledge,
            follow_ups: self.follow_ups,
            limiter: Arc::new(Semaphore::new(limit)),
            shutdown: CancellationToken::new(),
            history: Mutex::new(VecDeque::new()),
            settings: self.settings,
        }
    }
}

/// Runs operations through validation, idempotency, observability and hooks
pub struct Orchestrator {
    settings: OrchestratorSettings,
    validator: ContextValidator,
    idempotency: IdempotencyManager,
    hooks: HookRegistry,
    observability: Arc<ObservabilityManager>,
    knowledge: Option<Arc<dyn KnowledgeProvider>>,
    follow_ups: Option<Arc<dyn FollowUpProvider>>,
    limiter: Arc<Semaphore>,
    shutdown: CancellationToken,
    history: Mutex<VecDeque<HistoryEntry>>,
}

impl Orchestrator {
    pub fn builder(store: Arc<dyn IdempotencyStore>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store)
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn observability(&self) -> &Arc<ObservabilityManager> {
        &self.observability
    }

    pub fn idempotency(&self) -> &IdempotencyManager {
        &self.idempotency
    }

    /// Recent executions, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    /// Execute `handler` as `operation` for `ctx`
    pub async fn execute<F, Fut>(
        &self,
        operation: &str,
        ctx: OperationContext,
        handler: F,
    ) -> ExecutionResult
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.execute_with_cancel(operation, ctx, handler, CancellationToken::new())
            .await
    }

    /// Like `execute`, ending with `Cancelled` when `cancel` fires first
    #[instrument(skip(self, ctx, handler, cancel), fields(subject = %ctx.subject_id))]
    pub async fn execute_with_cancel<F, Fut>(
        &self,
        operation: &str,
        ctx: OperationContext,
        handler: F,
        cancel: CancellationToken,
    ) -> ExecutionResult
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let execution_id = Uuid::new_v4();
        let timestamp = Utc::now();
        let started = Instant::now();
        let subject_id = ctx.subject_id.clone();

        let outcome = self.run(operation, ctx, handler, &cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let metrics = ExecutionMetrics {
            execution_id,
            duration_ms,
            operation: operation.to_string(),
            timestamp,
            replayed: false,
        };

        let result = match outcome {
            Ok(Idempotent { value, replayed }) => {
                if replayed {
                    self.observability
                        .increment(&format!("{}.replayed", operation));
                }
                info!(operation, duration_ms, replayed, "Operation succeeded");

                let mut discoveries = BTreeMap::new();
                if let Some(knowledge) = self.ask_knowledge(operation, &subject_id).await {
                    discoveries.insert("knowledge".to_string(), Value::String(knowledge));
                }
                let follow_ups = self.generate_follow_ups(operation, Some(&value), None).await;

                ExecutionResult {
                    success: true,
                    result: Some(value),
                    error: None,
                    follow_ups,
                    discoveries,
                    metrics: ExecutionMetrics { replayed, ..metrics },
                }
            }
            Err(err) => {
                let failure = err.to_failure();
                warn!(operation, duration_ms, kind = failure.kind.as_str(), error = %failure.message, "Operation failed");

                let follow_ups = self
                    .generate_follow_ups(operation, None, Some(&failure))
                    .await;

                ExecutionResult {
                    success: false,
                    result: None,
                    error: Some(failure),
                    follow_ups,
                    discoveries: BTreeMap::new(),
                    metrics,
                }
            }
        };

        self.remember(&result);
        result
    }

    async fn run<F, Fut>(
        &self,
        operation: &str,
        ctx: OperationContext,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<Idempotent<Value>, PipelineError>
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if operation.trim().is_empty() {
            return Err(PipelineError::Validation(vec![
                ContextViolation::MissingField("operation"),
            ]));
        }

        let report = self.validator.validate(&ctx);
        for warning in &report.warnings {
            warn!(operation, request_id = %ctx.request_id, warning = %warning, "Context warning");
        }
        if !report.is_valid() {
            return Err(PipelineError::Validation(report.violations));
        }

        let _permit = self
            .limiter
            .clone()
            .try_acquire_owned()
            .map_err(|_| PipelineError::Overloaded {
                limit: self.settings.max_concurrent,
            })?;

        let key = generate_key(operation, &ctx);
        let ttl = self.idempotency.settings().ttl();
        debug!(operation, %key, "Idempotency key derived");

        let metadata = SpanMetadata {
            parent_span_id: ctx.parent_span_id.clone(),
            ..Default::default()
        }
        .tag("request_id", ctx.request_id.clone())
        .tag("subject_id", ctx.subject_id.clone())
        .tag("idempotency_key", key.clone());

        self.idempotency
            .execute_with_idempotency(&key, operation, ttl, || {
                self.observability.instrument(operation, metadata, |span| {
                    let mut ctx = ctx;
                    ctx.span_id = Some(span.span_id);
                    self.run_hooks(operation, ctx, handler, cancel)
                })
            })
            .await
    }

    /// The hook pipeline raced against cancellation and the operation timeout
    async fn run_hooks<F, Fut>(
        &self,
        operation: &str,
        mut ctx: OperationContext,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<Value, PipelineError>
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let timeout_ms = self.settings.operation_timeout_ms;
        let pipeline = self.hooks.execute_with_hooks(operation, &mut ctx, handler);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled {
                operation: operation.to_string(),
            }),
            _ = self.shutdown.cancelled() => Err(PipelineError::Cancelled {
                operation: operation.to_string(),
            }),
            outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), pipeline) => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(PipelineError::from(e)),
                Err(_) => Err(PipelineError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms,
                }),
            },
        }
    }

    fn enrichment_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.enrichment_timeout_ms)
    }

    async fn ask_knowledge(&self, operation: &str, subject_id: &str) -> Option<String> {
        let knowledge = self.knowledge.as_ref()?;
        let question = format!("What is relevant after {} for {}?", operation, subject_id);

        match tokio::time::timeout(self.enrichment_timeout(), knowledge.ask(operation, &question)).await {
            Ok(Ok(answer)) => Some(answer),
            Ok(Err(e)) => {
                warn!(operation, error = %e, "Knowledge lookup failed");
                None
            }
            Err(_) => {
                warn!(operation, "Knowledge lookup timed out");
                None
            }
        }
    }

    async fn generate_follow_ups(
        &self,
        operation: &str,
        result: Option<&Value>,
        error: Option<&ExecutionFailure>,
    ) -> Vec<Suggestion> {
        let Some(provider) = self.follow_ups.clone() else {
            return Vec::new();
        };

        let operation = operation.to_string();
        let history = self.history();
        let result = result.cloned();
        let error = error.cloned();

        // Providers are synchronous; run them off the runtime so the budget holds
        let task = tokio::task::spawn_blocking(move || {
            provider.generate(&FollowUpContext {
                operation: &operation,
                history: &history,
                result: result.as_ref(),
                error: error.as_ref(),
            })
        });

        match tokio::time::timeout(self.enrichment_timeout(), task).await {
            Ok(Ok(suggestions)) => suggestions,
            Ok(Err(e)) => {
                warn!(error = %e, "Follow-up generation failed");
                Vec::new()
            }
            Err(_) => {
                warn!("Follow-up generation timed out");
                Vec::new()
            }
        }
    }

    fn remember(&self, result: &ExecutionResult) {
        let mut history = self.history.lock();
        history.push_back(HistoryEntry::from_result(result));
        while history.len() > self.settings.history_size {
            history.pop_front();
        }
    }

    /// Periodic idempotency cleanup, stopped by `shutdown`
    pub fn spawn_cleanup(&self) -> JoinHandle<()> {
        self.idempotency.spawn_cleanup(self.shutdown.child_token())
    }

    /// Cancel every in-flight call and background task, then flush exporters
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.cancel();
        self.observability.flush_exporters().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
