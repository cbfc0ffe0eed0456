//! Store error types.

use thiserror::Error;

/// Outbox store error type.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Event not found: {0}")]
    NotFound(String),

    /// The event exists but its status does not allow the operation.
    #[error("Event {id} is {status}, operation not allowed")]
    InvalidState { id: String, status: String },

    /// Another poller holds the lease on this event.
    #[error("Event {0} is claimed by another poller")]
    ClaimLost(String),

    #[error("Invalid event: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn invalid_state(id: &str, status: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            id: id.to_string(),
            status: status.to_string(),
        }
    }
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;
