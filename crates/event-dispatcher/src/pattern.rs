//! Handler routing patterns.

use crate::{DispatchError, DispatchResult};
use std::fmt;

/// Which events a handler receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerPattern {
    /// One event type, e.g. `lead.created`.
    Exact(String),
    /// Every `<aggregate>.<action>` event of one aggregate, written `lead.*`.
    Aggregate(String),
    /// Every event, written `*`.
    Global,
}

impl HandlerPattern {
    pub fn parse(raw: &str) -> DispatchResult<Self> {
        let pattern = raw.trim();
        if pattern.is_empty() {
            return Err(DispatchError::invalid_pattern(raw, "pattern is empty"));
        }
        if pattern == "*" {
            return Ok(Self::Global);
        }

        if let Some(aggregate) = pattern.strip_suffix(".*") {
            if aggregate.is_empty() {
                return Err(DispatchError::invalid_pattern(raw, "aggregate is empty"));
            }
            if aggregate.contains('*') || aggregate.contains('.') {
                return Err(DispatchError::invalid_pattern(
                    raw,
                    "wildcard must follow a single aggregate name",
                ));
            }
            return Ok(Self::Aggregate(aggregate.to_string()));
        }

        if pattern.contains('*') {
            return Err(DispatchError::invalid_pattern(
                raw,
                "wildcards are only allowed as `*` or `<aggregate>.*`",
            ));
        }
        Ok(Self::Exact(pattern.to_string()))
    }

    /// Whether an event of `event_type` is routed to this pattern.
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == event_type,
            Self::Aggregate(aggregate) => event_type
                .split_once('.')
                .map_or(false, |(head, _)| head == aggregate),
            Self::Global => true,
        }
    }

    /// Short label used when listing registrations.
    pub fn label(&self) -> &str {
        match self {
            Self::Exact(event_type) => event_type,
            Self::Aggregate(aggregate) => aggregate,
            Self::Global => "*",
        }
    }
}

impl fmt::Display for HandlerPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(event_type) => f.write_str(event_type),
            Self::Aggregate(aggregate) => write!(f, "{}.*", aggregate),
            Self::Global => f.write_str("*"),
        }
    }
}

impl std::str::FromStr for HandlerPattern {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_variants() {
        assert_eq!(HandlerPattern::parse("*").unwrap(), HandlerPattern::Global);
        assert_eq!(
            HandlerPattern::parse("lead.*").unwrap(),
            HandlerPattern::Aggregate("lead".into())
        );
        assert_eq!(
            HandlerPattern::parse("lead.created").unwrap(),
            HandlerPattern::Exact("lead.created".into())
        );
        assert_eq!(
            HandlerPattern::parse(" contact.updated ").unwrap(),
            HandlerPattern::Exact("contact.updated".into())
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        for raw in ["", "   ", ".*", "*.created", "le*d.created", "lead.**", "*.*", "a.b.*"] {
            let err = HandlerPattern::parse(raw).unwrap_err();
            assert!(
                matches!(err, DispatchError::InvalidPattern { .. }),
                "{:?} -> {:?}",
                raw,
                err
            );
        }
    }

    #[test]
    fn exact_matches_only_itself() {
        let pattern = HandlerPattern::parse("lead.created").unwrap();
        assert!(pattern.matches("lead.created"));
        assert!(!pattern.matches("lead.updated"));
        assert!(!pattern.matches("lead.created.v2"));
    }

    #[test]
    fn aggregate_matches_first_segment() {
        let pattern = HandlerPattern::parse("lead.*").unwrap();
        assert!(pattern.matches("lead.created"));
        assert!(pattern.matches("lead.status.changed"));
        assert!(!pattern.matches("contact.created"));
        assert!(!pattern.matches("leads.created"));
        assert!(!pattern.matches("lead"));
    }

    #[test]
    fn global_matches_everything() {
        let pattern = HandlerPattern::Global;
        assert!(pattern.matches("lead.created"));
        assert!(pattern.matches("heartbeat"));
    }

    #[test]
    fn display_and_label() {
        let aggregate = HandlerPattern::parse("lead.*").unwrap();
        assert_eq!(aggregate.to_string(), "lead.*");
        assert_eq!(aggregate.label(), "lead");
        assert_eq!(HandlerPattern::Global.label(), "*");
        let exact: HandlerPattern = "lead.created".parse().unwrap();
        assert_eq!(exact.label(), "lead.created");
    }
}
