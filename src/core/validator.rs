//! Validation of the request envelope.
//!
//! Runs before any work starts. Violations are fatal; warnings are only
//! reported so the orchestrator can log them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::OperationContext;

use super::error::ContextViolation;

/// Freshness and shape limits for contexts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// Oldest accepted context in seconds (default: 60)
    #[serde(default = "default_max_age_seconds")]
    pub max_age_seconds: i64,

    /// Accepted clock skew for future timestamps in milliseconds (default: 1000)
    #[serde(default = "default_clock_skew_ms")]
    pub clock_skew_ms: i64,

    /// Extension count above which a warning is reported (default: 64)
    #[serde(default = "default_max_extensions")]
    pub max_extensions: usize,
}

fn default_max_age_seconds() -> i64 {
    60
}
fn default_clock_skew_ms() -> i64 {
    1000
}
fn default_max_extensions() -> usize {
    64
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_age_seconds: default_max_age_seconds(),
            clock_skew_ms: default_clock_skew_ms(),
            max_extensions: default_max_extensions(),
        }
    }
}

/// Outcome of validating one context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub violations: Vec<ContextViolation>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Checks required fields and timestamp freshness
#[derive(Debug, Clone, Default)]
pub struct ContextValidator {
    settings: ValidationSettings,
}

impl ContextValidator {
    pub fn new(settings: ValidationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    /// Validate against the current time
    pub fn validate(&self, ctx: &OperationContext) -> ValidationReport {
        self.validate_at(ctx, Utc::now())
    }

    /// Validate against an explicit "now"
    pub fn validate_at(&self, ctx: &OperationContext, now: DateTime<Utc>) -> ValidationReport {
        let mut report = ValidationReport::default();

        if ctx.request_id.trim().is_empty() {
            report.violations.push(ContextViolation::MissingField("request_id"));
        }
        if ctx.subject_id.trim().is_empty() {
            report.violations.push(ContextViolation::MissingField("subject_id"));
        }

        let max_age = Duration::seconds(self.settings.max_age_seconds);
        let skew = Duration::milliseconds(self.settings.clock_skew_ms);
        let age = now - ctx.timestamp;

        if age > max_age {
            report.violations.push(ContextViolation::Stale {
                age_ms: age.num_milliseconds(),
                max_age_ms: max_age.num_milliseconds(),
            });
        } else if -age > skew {
            report.violations.push(ContextViolation::FutureTimestamp {
                ahead_ms: (-age).num_milliseconds(),
                tolerance_ms: skew.num_milliseconds(),
            });
        }

        if matches!(ctx.parent_span_id.as_deref(), Some(p) if p.trim().is_empty()) {
            report.warnings.push("parent_span_id is present but empty".to_string());
        }
        if ctx.extensions.len() > self.settings.max_extensions {
            report.warnings.push(format!(
                "context carries {} extensions (more than {})",
                ctx.extensions.len(),
                self.settings.max_extensions
            ));
        }
        if ctx.result.is_some() || ctx.error.is_some() {
            report
                .warnings
                .push("context arrived with result/error already set; they will be overwritten".to_string());
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ContextValidator {
        ContextValidator::default()
    }

    #[test]
    fn test_fresh_context_is_valid() {
        let ctx = OperationContext::with_request_id("r1", "m1");
        let report = validator().validate(&ctx);
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_stale_context_rejected() {
        let now = Utc::now();
        let ctx = OperationContext::with_request_id("r1", "m1").at(now - Duration::minutes(2));

        let report = validator().validate_at(&ctx, now);
        assert!(matches!(
            report.violations.as_slice(),
            [ContextViolation::Stale { age_ms: 120_000, max_age_ms: 60_000 }]
        ));
    }

    #[test]
    fn test_future_context_rejected() {
        let now = Utc::now();
        let ctx = OperationContext::with_request_id("r1", "m1").at(now + Duration::seconds(2));

        let report = validator().validate_at(&ctx, now);
        assert!(matches!(
            report.violations.as_slice(),
            [ContextViolation::FutureTimestamp { ahead_ms: 2000, tolerance_ms: 1000 }]
        ));
    }

    #[test]
    fn test_small_skew_tolerated() {
        let now = Utc::now();
        let ctx = OperationContext::with_request_id("r1", "m1").at(now + Duration::milliseconds(500));
        assert!(validator().validate_at(&ctx, now).is_valid());
    }

    #[test]
    fn test_missing_fields_reported_together() {
        let ctx = OperationContext::with_request_id("", " ");
        let report = validator().validate(&ctx);
        assert_eq!(
            report.violations,
            vec![
                ContextViolation::MissingField("request_id"),
                ContextViolation::MissingField("subject_id"),
            ]
        );
    }

    #[test]
    fn test_warnings_are_not_fatal() {
        let mut ctx = OperationContext::with_request_id("r1", "m1").with_parent_span("");
        ctx.result = Some(serde_json::json!({"stale": true}));

        let report = validator().validate(&ctx);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2);
    }
}
