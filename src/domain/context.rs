//! The request envelope carried through the pipeline.
//!
//! A context is created by the caller for one invocation, passed through
//! validation, hooks and the main logic, and discarded once the call returns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope for a single operation invocation.
///
/// The required fields are fixed; domain data lives in `extensions`, an
/// ordered map so that serialization is canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    /// Unique id of this request (differs between retries)
    pub request_id: String,

    /// The subject the operation acts on (merchant, account, ...)
    pub subject_id: String,

    /// When the caller created this context
    pub timestamp: DateTime<Utc>,

    /// Span of the caller, if the call is part of a larger trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Span opened by the pipeline for this call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    /// Domain payload
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,

    /// Result of the main logic, visible to post hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error of the main logic, visible to error hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationContext {
    /// Create a context stamped with the current time and a fresh request id
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self::with_request_id(Uuid::new_v4().to_string(), subject_id)
    }

    /// Create a context with an explicit request id
    pub fn with_request_id(request_id: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            subject_id: subject_id.into(),
            timestamp: Utc::now(),
            parent_span_id: None,
            span_id: None,
            extensions: BTreeMap::new(),
            result: None,
            error: None,
        }
    }

    /// Override the creation timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach the caller's span
    pub fn with_parent_span(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    /// Add a payload field
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Read a payload field
    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }

    /// Set a payload field in place
    pub fn set_extension(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extensions.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let ctx = OperationContext::with_request_id("r1", "m1")
            .with_parent_span("parent")
            .with_extension("amount", 1200);

        assert_eq!(ctx.request_id, "r1");
        assert_eq!(ctx.subject_id, "m1");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("parent"));
        assert_eq!(ctx.extension("amount"), Some(&Value::from(1200)));
        assert!(ctx.result.is_none());
    }

    #[test]
    fn test_serialization_skips_empty_pipeline_fields() {
        let ctx = OperationContext::with_request_id("r1", "m1");
        let json = serde_json::to_value(&ctx).unwrap();

        assert!(json.get("span_id").is_none());
        assert!(json.get("result").is_none());

        let parsed: OperationContext = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, ctx);
    }
}
