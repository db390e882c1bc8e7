//! opguard - adaptive hook orchestration for async operations
//!
//! Wraps any named async operation with three guarantees:
//! - idempotent execution: one logical request runs at most once, repeats
//!   get the cached result
//! - ordered extensibility: prioritized pre/around/post/error hooks with
//!   failure isolation and a circuit breaker
//! - observability: spans, counters, pluggable exporters and alerts on
//!   repeated errors
//!
//! # Modules
//!
//! - `adapters`: Collaborator traits and stock exporters/sinks
//! - `core`: Validator, idempotency, hooks, observability, orchestrator
//! - `domain`: Data structures (context, hook, records, spans, results)
//! - `cli`: Operator command-line interface
//!
//! # Usage
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::builder(Arc::new(MemoryIdempotencyStore::new())).build();
//! let ctx = OperationContext::new("merchant-42").with_extension("amount", 100);
//! let result = orchestrator
//!     .execute("payment.charge", ctx, |ctx| async move { charge(ctx).await })
//!     .await;
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{
    HookRegistry, IdempotencyManager, MemoryIdempotencyStore, ObservabilityManager, Orchestrator,
    PipelineError, SqliteIdempotencyStore,
};
pub use crate::domain::{ErrorKind, ExecutionResult, Hook, OperationContext};
