//! Hook definitions.
//!
//! A hook is a callback attached to an operation. Its kind decides when it
//! runs and what it receives:
//! - `pre`: before the main logic, may rewrite the context
//! - `around`: wraps the main logic, decides whether and how to call it
//! - `post`: after a successful main logic, sees the result in the context
//! - `error`: after a failed main logic, sees the error in the context

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::OperationContext;

/// Boxed, sendable future used by hooks and the main logic
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The rest of the chain, handed to an around hook
pub type Next = Box<dyn FnOnce(OperationContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

/// Predicate deciding whether a hook applies to a context
pub type Condition = Arc<dyn Fn(&OperationContext) -> bool + Send + Sync>;

/// Hook receiving and returning the context (pre, post, error)
pub trait ContextHook: Send + Sync {
    fn call(&self, ctx: OperationContext) -> BoxFuture<'static, anyhow::Result<OperationContext>>;
}

impl<F, Fut> ContextHook for F
where
    F: Fn(OperationContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<OperationContext>> + Send + 'static,
{
    fn call(&self, ctx: OperationContext) -> BoxFuture<'static, anyhow::Result<OperationContext>> {
        Box::pin((self)(ctx))
    }
}

/// Hook wrapping the rest of the chain
pub trait AroundHook: Send + Sync {
    fn call(&self, ctx: OperationContext, next: Next) -> BoxFuture<'static, anyhow::Result<Value>>;
}

impl<F, Fut> AroundHook for F
where
    F: Fn(OperationContext, Next) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn call(&self, ctx: OperationContext, next: Next) -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin((self)(ctx, next))
    }
}

/// Kind of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Pre,
    Post,
    Around,
    Error,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Pre => "pre",
            HookKind::Post => "post",
            HookKind::Around => "around",
            HookKind::Error => "error",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler of a hook, tagged by kind
#[derive(Clone)]
pub enum HookHandler {
    Pre(Arc<dyn ContextHook>),
    Post(Arc<dyn ContextHook>),
    Around(Arc<dyn AroundHook>),
    Error(Arc<dyn ContextHook>),
}

impl HookHandler {
    pub fn kind(&self) -> HookKind {
        match self {
            HookHandler::Pre(_) => HookKind::Pre,
            HookHandler::Post(_) => HookKind::Post,
            HookHandler::Around(_) => HookKind::Around,
            HookHandler::Error(_) => HookKind::Error,
        }
    }
}

/// A registered hook
///
/// The id has the form `"<operation>:<name>"`; the registry attaches the hook
/// to the operation named by the prefix.
#[derive(Clone)]
pub struct Hook {
    pub id: String,
    /// Higher runs first
    pub priority: i32,
    pub handler: HookHandler,
    pub condition: Option<Condition>,
}

impl Hook {
    pub fn new(id: impl Into<String>, priority: i32, handler: HookHandler) -> Self {
        Self {
            id: id.into(),
            priority,
            handler,
            condition: None,
        }
    }

    /// Build a pre hook from an async closure
    pub fn pre<F, Fut>(id: impl Into<String>, priority: i32, f: F) -> Self
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<OperationContext>> + Send + 'static,
    {
        Self::new(id, priority, HookHandler::Pre(Arc::new(f)))
    }

    /// Build a post hook from an async closure
    pub fn post<F, Fut>(id: impl Into<String>, priority: i32, f: F) -> Self
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<OperationContext>> + Send + 'static,
    {
        Self::new(id, priority, HookHandler::Post(Arc::new(f)))
    }

    /// Build an error hook from an async closure
    pub fn error<F, Fut>(id: impl Into<String>, priority: i32, f: F) -> Self
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<OperationContext>> + Send + 'static,
    {
        Self::new(id, priority, HookHandler::Error(Arc::new(f)))
    }

    /// Build an around hook from an async closure
    pub fn around<F, Fut>(id: impl Into<String>, priority: i32, f: F) -> Self
    where
        F: Fn(OperationContext, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(id, priority, HookHandler::Around(Arc::new(f)))
    }

    /// Only run the hook when `condition` holds for the context
    pub fn when<C>(mut self, condition: C) -> Self
    where
        C: Fn(&OperationContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn kind(&self) -> HookKind {
        self.handler.kind()
    }

    /// Operation this hook is attached to (the id prefix)
    pub fn operation(&self) -> Option<&str> {
        let (operation, name) = self.id.split_once(':')?;
        if operation.is_empty() || name.is_empty() {
            return None;
        }
        Some(operation)
    }

    /// Evaluate the condition (absent means always)
    pub fn applies_to(&self, ctx: &OperationContext) -> bool {
        self.condition.as_ref().map(|c| c(ctx)).unwrap_or(true)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("priority", &self.priority)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

/// Live performance data for one hook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookPerformance {
    /// Exponential moving average of the duration in milliseconds
    pub avg_duration_ms: f64,
    pub call_count: u64,
    pub failure_count: u32,
    pub last_called: Option<DateTime<Utc>>,
    /// Set once failures reach the threshold, never cleared
    pub disabled: bool,
}

impl HookPerformance {
    /// Fold a new sample into the moving average
    pub fn record_duration(&mut self, sample_ms: f64) {
        self.avg_duration_ms = self.avg_duration_ms * 0.9 + sample_ms * 0.1;
        self.call_count += 1;
        self.last_called = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_from_id() {
        let hook = Hook::pre("payment.charge:audit", 1, |ctx| async move { Ok(ctx) });
        assert_eq!(hook.operation(), Some("payment.charge"));
        assert_eq!(hook.kind(), HookKind::Pre);

        let bad = Hook::pre("no-separator", 1, |ctx| async move { Ok(ctx) });
        assert_eq!(bad.operation(), None);

        let empty_name = Hook::pre("payment.charge:", 1, |ctx| async move { Ok(ctx) });
        assert_eq!(empty_name.operation(), None);
    }

    #[test]
    fn test_condition() {
        let hook = Hook::post("op:large", 1, |ctx| async move { Ok(ctx) })
            .when(|ctx| ctx.extension("large").is_some());

        let plain = OperationContext::new("m1");
        let large = OperationContext::new("m1").with_extension("large", true);

        assert!(!hook.applies_to(&plain));
        assert!(hook.applies_to(&large));
    }

    #[test]
    fn test_moving_average() {
        let mut perf = HookPerformance::default();
        perf.record_duration(100.0);
        assert!((perf.avg_duration_ms - 10.0).abs() < 1e-9);
        perf.record_duration(100.0);
        assert!((perf.avg_duration_ms - 19.0).abs() < 1e-9);
        assert_eq!(perf.call_count, 2);
        assert!(perf.last_called.is_some());
    }
}
