//! Poller error types.

use outbox_store::StoreError;
use thiserror::Error;

/// Poller error type.
#[derive(Error, Debug)]
pub enum PollerError {
    /// The batch could not be fetched; the cycle was skipped.
    #[error("Failed to fetch pending events: {0}")]
    Fetch(#[from] StoreError),

    #[error("Invalid poller configuration: {0}")]
    Config(String),
}

/// Result type alias using PollerError.
pub type PollerResult<T> = Result<T, PollerError>;
