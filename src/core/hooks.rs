//! Hook registry and hook pipeline execution.
//!
//! Hooks are grouped per operation and kept sorted by priority. Each
//! execution works on an immutable snapshot of the list; registration and the
//! performance-based reorder publish a new list instead of mutating in place.
//!
//! # Execution Model
//! ```text
//! pre hooks (priority order)
//! around[0] {
//!     around[1] {
//!         main_logic
//!     }
//! }
//! post hooks on success | error hooks on failure
//! ```
//!
//! Failures of pre, post and error hooks are isolated: logged, counted, and
//! after `failure_threshold` failures the hook is disabled for good.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{
    BoxFuture, ContextHook, Hook, HookHandler, HookKind, HookPerformance, Next, OperationContext,
};

/// Circuit breaker and self-tuning thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSettings {
    /// Failures after which a hook is disabled (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Calls to a hook between reorders of its operation (default: 100)
    #[serde(default = "default_optimization_threshold")]
    pub optimization_threshold: u64,

    /// Average duration above which a hook is reported as slow (default: 10ms)
    #[serde(default = "default_slow_hook_ms")]
    pub slow_hook_ms: f64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_optimization_threshold() -> u64 {
    100
}
fn default_slow_hook_ms() -> f64 {
    10.0
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            optimization_threshold: default_optimization_threshold(),
            slow_hook_ms: default_slow_hook_ms(),
        }
    }
}

/// Rejected registrations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookRegistrationError {
    #[error("hook id must not be empty")]
    EmptyId,

    #[error("hook id '{0}' must have the form '<operation>:<name>'")]
    MalformedId(String),

    #[error("hook '{0}' is already registered")]
    Duplicate(String),
}

type HookList = Arc<Vec<Arc<Hook>>>;

/// Lower bound for the average duration when computing reorder scores
const MIN_SCORE_DURATION_MS: f64 = 0.001;

/// Per-operation hook table with performance tracking.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone)]
pub struct HookRegistry {
    settings: HookSettings,
    hooks: Arc<ArcSwap<HashMap<String, HookList>>>,
    performance: Arc<Mutex<HashMap<String, HookPerformance>>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new(HookSettings::default())
    }
}

impl HookRegistry {
    pub fn new(settings: HookSettings) -> Self {
        Self {
            settings,
            hooks: Arc::new(ArcSwap::from_pointee(HashMap::new())),
            performance: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &HookSettings {
        &self.settings
    }

    /// Register a hook for the operation named by its id prefix.
    ///
    /// The operation's list is re-sorted by descending priority; hooks with
    /// equal priority keep registration order.
    pub fn register(&self, hook: Hook) -> Result<(), HookRegistrationError> {
        if hook.id.trim().is_empty() {
            return Err(HookRegistrationError::EmptyId);
        }
        let operation = hook
            .operation()
            .ok_or_else(|| HookRegistrationError::MalformedId(hook.id.clone()))?
            .to_string();

        {
            let mut performance = self.performance.lock();
            if performance.contains_key(&hook.id) {
                return Err(HookRegistrationError::Duplicate(hook.id.clone()));
            }
            performance.insert(hook.id.clone(), HookPerformance::default());
        }

        let hook = Arc::new(hook);
        self.hooks.rcu(|current| {
            let mut table = HashMap::clone(current);
            let mut list: Vec<Arc<Hook>> = table
                .get(&operation)
                .map(|l| l.as_ref().clone())
                .unwrap_or_default();
            list.push(hook.clone());
            list.sort_by(|a, b| b.priority.cmp(&a.priority));
            table.insert(operation.clone(), Arc::new(list));
            table
        });

        info!(hook = %hook.id, kind = %hook.kind(), priority = hook.priority, %operation, "Hook registered");
        Ok(())
    }

    /// Remove a hook. Returns whether it was registered.
    pub fn unregister(&self, id: &str) -> bool {
        if self.performance.lock().remove(id).is_none() {
            return false;
        }

        self.hooks.rcu(|current| {
            let mut table = HashMap::clone(current);
            for list in table.values_mut() {
                if list.iter().any(|h| h.id == id) {
                    let kept: Vec<Arc<Hook>> = list.iter().filter(|h| h.id != id).cloned().collect();
                    *list = Arc::new(kept);
                }
            }
            table.retain(|_, list| !list.is_empty());
            table
        });

        info!(hook = id, "Hook unregistered");
        true
    }

    /// Hook ids of an operation in current execution order
    pub fn hooks_for(&self, operation: &str) -> Vec<String> {
        self.snapshot(operation).iter().map(|h| h.id.clone()).collect()
    }

    /// Performance record of one hook
    pub fn performance(&self, id: &str) -> Option<HookPerformance> {
        self.performance.lock().get(id).cloned()
    }

    /// Performance records of all hooks, sorted by id
    pub fn performance_report(&self) -> BTreeMap<String, HookPerformance> {
        self.performance
            .lock()
            .iter()
            .map(|(id, perf)| (id.clone(), perf.clone()))
            .collect()
    }

    /// Whether the circuit breaker has disabled a hook
    pub fn is_disabled(&self, id: &str) -> bool {
        self.performance
            .lock()
            .get(id)
            .map(|p| p.disabled)
            .unwrap_or(false)
    }

    fn snapshot(&self, operation: &str) -> HookList {
        self.hooks.load().get(operation).cloned().unwrap_or_default()
    }

    fn is_active(&self, hook: &Hook, ctx: &OperationContext) -> bool {
        !self.is_disabled(&hook.id) && hook.applies_to(ctx)
    }

    /// Run the hooks of `operation` around `main_logic`.
    ///
    /// `ctx` is updated in place: pre hooks may rewrite it, and it carries the
    /// result (or error) into post (or error) hooks. The error of the main
    /// logic or the around chain is returned unchanged after the error hooks
    /// have run; hook failures never reach the caller.
    pub async fn execute_with_hooks<F, Fut>(
        &self,
        operation: &str,
        ctx: &mut OperationContext,
        main_logic: F,
    ) -> anyhow::Result<Value>
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let hooks = self.snapshot(operation);
        debug!(operation, hooks = hooks.len(), "Executing with hooks");

        for hook in hooks.iter() {
            if let HookHandler::Pre(handler) = &hook.handler {
                self.run_context_hook(hook, handler, ctx).await;
            }
        }

        let main: Next = Box::new(move |ctx: OperationContext| -> BoxFuture<'static, anyhow::Result<Value>> {
            Box::pin(main_logic(ctx))
        });
        let chain = self.build_around_chain(&hooks, ctx, main);

        // The chain is entered inside the guarded future so a panicking
        // main_logic or around hook surfaces as an error
        let entry = ctx.clone();
        let outcome = AssertUnwindSafe(async move { chain(entry).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                warn!(operation, panic = %message, "Operation panicked");
                Err(anyhow::anyhow!("panicked: {}", message))
            });

        match outcome {
            Ok(value) => {
                ctx.result = Some(value.clone());
                ctx.error = None;
                for hook in hooks.iter() {
                    if let HookHandler::Post(handler) = &hook.handler {
                        self.run_context_hook(hook, handler, ctx).await;
                    }
                }
                Ok(value)
            }
            Err(err) => {
                ctx.error = Some(format!("{:#}", err));
                for hook in hooks.iter() {
                    if let HookHandler::Error(handler) = &hook.handler {
                        self.run_context_hook(hook, handler, ctx).await;
                    }
                }
                Err(err)
            }
        }
    }

    /// Wrap `main` in the active around hooks, outermost = highest priority
    fn build_around_chain(&self, hooks: &[Arc<Hook>], ctx: &OperationContext, main: Next) -> Next {
        let arounds: Vec<Arc<Hook>> = hooks
            .iter()
            .filter(|h| h.kind() == HookKind::Around && self.is_active(h, ctx))
            .cloned()
            .collect();

        let mut next = main;
        for hook in arounds.into_iter().rev() {
            let HookHandler::Around(handler) = hook.handler.clone() else {
                continue;
            };
            let registry = self.clone();
            let inner = next;

            next = Box::new(move |ctx: OperationContext| -> BoxFuture<'static, anyhow::Result<Value>> {
                Box::pin(async move {
                    let started = Instant::now();
                    let result = handler.call(ctx, inner).await;
                    // Errors here belong to the wrapped call, not to the hook
                    registry.record_invocation(&hook, started.elapsed().as_secs_f64() * 1000.0, false);
                    result
                })
            });
        }
        next
    }

    /// Run one pre/post/error hook with failure isolation
    async fn run_context_hook(
        &self,
        hook: &Hook,
        handler: &Arc<dyn ContextHook>,
        ctx: &mut OperationContext,
    ) {
        if !self.is_active(hook, ctx) {
            return;
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.call(ctx.clone()))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(Ok(updated)) => {
                *ctx = updated;
                self.record_invocation(hook, elapsed_ms, false);
            }
            Ok(Err(e)) => {
                warn!(hook = %hook.id, kind = %hook.kind(), error = %e, "Hook failed, continuing");
                self.record_invocation(hook, elapsed_ms, true);
            }
            Err(_) => {
                warn!(hook = %hook.id, kind = %hook.kind(), "Hook panicked, continuing");
                self.record_invocation(hook, elapsed_ms, true);
            }
        }
    }

    /// Update the performance record and reorder when due
    fn record_invocation(&self, hook: &Hook, elapsed_ms: f64, failed: bool) {
        let reorder_due = {
            let mut performance = self.performance.lock();
            let Some(perf) = performance.get_mut(&hook.id) else {
                // Unregistered while running
                return;
            };

            perf.record_duration(elapsed_ms);

            if failed {
                perf.failure_count += 1;
                if !perf.disabled && perf.failure_count >= self.settings.failure_threshold {
                    perf.disabled = true;
                    warn!(
                        hook = %hook.id,
                        failures = perf.failure_count,
                        "Hook disabled after repeated failures"
                    );
                }
            }

            if perf.avg_duration_ms > self.settings.slow_hook_ms {
                warn!(
                    hook = %hook.id,
                    avg_duration_ms = perf.avg_duration_ms,
                    threshold_ms = self.settings.slow_hook_ms,
                    "Slow hook"
                );
            }

            self.settings.optimization_threshold > 0
                && perf.call_count % self.settings.optimization_threshold == 0
        };

        if reorder_due {
            if let Some(operation) = hook.operation() {
                self.optimize(operation);
            }
        }
    }

    /// Re-sort an operation's hooks by priority per millisecond of average cost
    pub fn optimize(&self, operation: &str) {
        let averages: HashMap<String, f64> = self
            .performance
            .lock()
            .iter()
            .map(|(id, perf)| (id.clone(), perf.avg_duration_ms))
            .collect();

        let score = |hook: &Hook| {
            let avg = averages
                .get(&hook.id)
                .copied()
                .unwrap_or(0.0)
                .max(MIN_SCORE_DURATION_MS);
            f64::from(hook.priority) / avg
        };

        self.hooks.rcu(|current| {
            let mut table = HashMap::clone(current);
            if let Some(list) = table.get_mut(operation) {
                let mut sorted = list.as_ref().clone();
                sorted.sort_by(|a, b| score(b).total_cmp(&score(a)));
                *list = Arc::new(sorted);
            }
            table
        });

        debug!(operation, order = ?self.hooks_for(operation), "Hooks reordered by performance");
    }
}

/// Text of a panic payload, when it carries one
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
