//! Rule-based follow-up suggestions.

use crate::domain::{ErrorKind, Suggestion};

use super::{FollowUpContext, FollowUpProvider};

/// Consecutive failures of one operation that trigger an escalation hint
const FAILURE_STREAK: usize = 3;

/// Suggests next actions from the failure kind and recent history
#[derive(Debug, Default, Clone)]
pub struct ErrorKindFollowUps;

impl ErrorKindFollowUps {
    pub fn new() -> Self {
        Self
    }

    fn for_kind(kind: ErrorKind) -> Suggestion {
        match kind {
            ErrorKind::Validation => Suggestion::new(
                "Fix the request",
                "The request context was rejected; check the listed violations and resend with a fresh timestamp",
                90,
            ),
            ErrorKind::Conflict => Suggestion::new(
                "Retry later",
                "The same operation is already running for this subject and payload",
                80,
            ),
            ErrorKind::Timeout => Suggestion::new(
                "Retry with backoff",
                "The operation exceeded its time budget",
                70,
            ),
            ErrorKind::Overloaded => Suggestion::new(
                "Retry with backoff",
                "The pipeline is at its concurrency limit",
                70,
            ),
            ErrorKind::Cancelled => Suggestion::new(
                "Resubmit if still needed",
                "The call was cancelled before it finished",
                40,
            ),
            ErrorKind::Store => Suggestion::new(
                "Check the idempotency database",
                "The idempotency store could not be read or written",
                85,
            ),
            ErrorKind::Serialization => Suggestion::new(
                "Check the handler result",
                "The result could not be serialized for caching",
                60,
            ),
            ErrorKind::Handler => Suggestion::new(
                "Inspect the handler error",
                "The operation itself failed; the error message has the details",
                50,
            ),
        }
    }
}

impl FollowUpProvider for ErrorKindFollowUps {
    fn generate(&self, ctx: &FollowUpContext<'_>) -> Vec<Suggestion> {
        let mut suggestions = Vec::new();

        if let Some(error) = ctx.error {
            suggestions.push(Self::for_kind(error.kind));
        }

        let streak = ctx
            .history
            .iter()
            .rev()
            .take_while(|h| h.operation == ctx.operation && !h.success)
            .count();
        if ctx.error.is_some() && streak >= FAILURE_STREAK {
            suggestions.push(Suggestion::new(
                "Investigate repeated failures",
                format!("{} has failed {} times in a row", ctx.operation, streak),
                95,
            ));
        }

        suggestions.sort_by(|a, b| b.priority.cmp(&a.priority));
        suggestions
    }
}
