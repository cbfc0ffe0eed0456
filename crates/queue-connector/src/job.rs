//! Job envelope and queue events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of work stored in a queue list as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Job name chosen by the producer, e.g. the outbox event type.
    pub name: String,
    pub data: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Failed processing attempts so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            data,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}

/// Emitted by workers after each job settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    Completed { queue: String, job_id: String },
    Failed { queue: String, job_id: String, error: String },
}

impl QueueEvent {
    pub fn queue(&self) -> &str {
        match self {
            Self::Completed { queue, .. } | Self::Failed { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Completed { job_id, .. } | Self::Failed { job_id, .. } => job_id,
        }
    }
}
