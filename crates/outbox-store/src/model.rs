//! Outbox event model types.

use crate::{StoreError, StoreResult};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for (another) dispatch attempt.
    Pending,
    /// Every matched handler succeeded.
    Published,
    /// Transient state between a failed attempt and its retry bookkeeping.
    Failed,
    /// Retries exhausted; the event lives in the dead-letter partition.
    DeadLettered,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "published" => Some(Self::Published),
            "failed" => Some(Self::Failed),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracing metadata attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
}

impl EventMetadata {
    /// Fresh metadata: random correlation id, current time, version 1.
    pub fn generate() -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now(),
            version: 1,
        }
    }
}

/// A domain event recorded in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: String,
    /// Dotted `<aggregate>.<action>` name used for routing.
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
    pub status: EventStatus,
    pub retry_count: u32,
    /// Not eligible for fetch before this instant.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Aggregate segment of the event type (text before the first `.`).
    pub fn aggregate(&self) -> &str {
        self.event_type
            .split_once('.')
            .map(|(aggregate, _)| aggregate)
            .unwrap_or(&self.event_type)
    }

    /// Whether the poller may pick this event up at `at`.
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.next_retry_at.map_or(true, |t| t <= at)
    }

    pub(crate) fn from_new(new: NewOutboxEvent) -> Self {
        let created_at = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: new.event_type,
            aggregate_type: new.aggregate_type,
            aggregate_id: new.aggregate_id,
            payload: new.payload,
            metadata: match new.metadata {
                Some(mut metadata) => {
                    metadata.timestamp = metadata.timestamp.trunc_subsecs(3);
                    metadata
                }
                None => EventMetadata {
                    correlation_id: uuid::Uuid::new_v4().to_string(),
                    timestamp: created_at,
                    version: 1,
                },
            },
            status: EventStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            created_at,
            published_at: None,
        }
    }
}

/// Producer input for a new outbox event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: Option<EventMetadata>,
}

impl NewOutboxEvent {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Reject input that could never be routed or attributed.
    pub fn validate(&self) -> StoreResult<()> {
        let event_type = self.event_type.trim();
        if event_type.is_empty() {
            return Err(StoreError::Validation("event_type is empty".into()));
        }
        if event_type == "*" || event_type.ends_with(".*") {
            return Err(StoreError::Validation(format!(
                "event_type {:?} is a routing pattern, not an event name",
                self.event_type
            )));
        }
        if self.aggregate_type.trim().is_empty() {
            return Err(StoreError::Validation("aggregate_type is empty".into()));
        }
        if self.aggregate_id.trim().is_empty() {
            return Err(StoreError::Validation("aggregate_id is empty".into()));
        }
        Ok(())
    }
}

/// An event that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: OutboxEvent,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub(crate) fn new(mut event: OutboxEvent, reason: &str) -> Self {
        event.status = EventStatus::DeadLettered;
        event.last_error = Some(reason.to_string());
        Self {
            event,
            reason: reason.to_string(),
            dead_lettered_at: now(),
        }
    }
}

/// Current time truncated to the millisecond precision both backends persist.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
