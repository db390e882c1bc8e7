//! Core pipeline logic.
//!
//! This module contains:
//! - Validator: request envelope checks
//! - Store / Idempotency: at-most-once execution and result caching
//! - Hooks: typed hook registry with failure isolation and self-tuning order
//! - Observability: spans, counters, exporters and alerts
//! - Orchestrator: the entry point tying them together

pub mod error;
pub mod hooks;
pub mod idempotency;
pub mod observability;
pub mod orchestrator;
pub mod store;
pub mod validator;

// Re-export commonly used types
pub use error::{ContextViolation, PipelineError, StoreError};
pub use hooks::{HookRegistrationError, HookRegistry, HookSettings};
pub use idempotency::{generate_key, hash_input, IdempotencyManager, IdempotencySettings, Idempotent};
pub use observability::{ObservabilityManager, ObservabilitySettings, SpanContext, SpanMetadata};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorSettings};
pub use store::{ClaimOutcome, IdempotencyStore, MemoryIdempotencyStore, SqliteIdempotencyStore};
pub use validator::{ContextValidator, ValidationReport, ValidationSettings};
