//! Dispatch error types.

use serde::Serialize;
use thiserror::Error;

/// One handler that did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerFailure {
    pub handler: String,
    pub pattern: String,
    pub cause: String,
}

/// Dispatcher error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Invalid handler pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Handler name already registered: {0}")]
    DuplicateHandler(String),

    /// At least one matched handler failed, panicked or timed out.
    #[error("{}", describe_failures(.event_id, .failures))]
    HandlersFailed {
        event_id: String,
        failures: Vec<HandlerFailure>,
    },
}

impl DispatchError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: &str) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Failed handlers, empty for registration errors.
    pub fn failures(&self) -> &[HandlerFailure] {
        match self {
            Self::HandlersFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}

fn describe_failures(event_id: &str, failures: &[HandlerFailure]) -> String {
    match failures.split_first() {
        None => format!("Dispatch of event {} failed", event_id),
        Some((first, [])) => format!(
            "Handler {} failed for event {}: {}",
            first.handler, event_id, first.cause
        ),
        Some((first, rest)) => format!(
            "Handler {} failed for event {}: {} (and {} more)",
            first.handler,
            event_id,
            first.cause,
            rest.len()
        ),
    }
}

/// Result type alias using DispatchError.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(name: &str, cause: &str) -> HandlerFailure {
        HandlerFailure {
            handler: name.into(),
            pattern: "lead.*".into(),
            cause: cause.into(),
        }
    }

    #[test]
    fn display_single_failure() {
        let err = DispatchError::HandlersFailed {
            event_id: "evt-1".into(),
            failures: vec![failure("crm-sync", "connection refused")],
        };
        assert_eq!(
            err.to_string(),
            "Handler crm-sync failed for event evt-1: connection refused"
        );
    }

    #[test]
    fn display_counts_remaining_failures() {
        let err = DispatchError::HandlersFailed {
            event_id: "evt-1".into(),
            failures: vec![
                failure("a", "first"),
                failure("b", "second"),
                failure("c", "third"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Handler a failed for event evt-1: first (and 2 more)"
        );
        assert_eq!(err.failures().len(), 3);
    }

    #[test]
    fn registration_errors_have_no_failures() {
        let err = DispatchError::DuplicateHandler("x".into());
        assert!(err.failures().is_empty());
    }
}
