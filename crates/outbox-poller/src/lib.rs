//! Outbox poller.
//!
//! On every tick the poller fetches a batch of due events, hands each one to
//! the [`EventDispatcher`](event_dispatcher::EventDispatcher) and writes the
//! outcome back to the store:
//!
//! - every handler succeeded: published
//! - a handler failed with retries left: rescheduled after a backoff delay
//! - a handler failed on the last attempt: moved to the dead-letter partition
//!
//! A failure on one event never affects its siblings, and a store error only
//! skips the affected event (or, for fetch errors, the current cycle).

mod config;
mod error;
mod poller;
mod stats;

pub use config::PollerConfig;
pub use error::{PollerError, PollerResult};
pub use poller::OutboxPoller;
pub use stats::{CycleReport, PollerStats};
