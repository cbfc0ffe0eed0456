//! Error types for the queue connector.

use thiserror::Error;

/// Queue connector error type.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Queue connector is not connected")]
    NotConnected,

    /// Operation on a queue or worker that was already closed
    #[error("Queue {0} is closed")]
    Closed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker error: {0}")]
    Worker(String),
}

/// Result type for queue connector operations.
pub type QueueResult<T> = Result<T, QueueError>;
