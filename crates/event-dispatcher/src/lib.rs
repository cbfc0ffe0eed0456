//! In-process routing of outbox events to registered handlers.
//!
//! Handlers register against a [`HandlerPattern`]:
//! - `"lead.created"`: exactly that event type
//! - `"lead.*"`: every event of the `lead` aggregate
//! - `"*"`: every event
//!
//! [`EventDispatcher::dispatch`] runs the union of all matching handlers,
//! each in its own task and bounded by a timeout, and reports every failure.
//! The dispatcher never touches the store; persisting the outcome is the
//! poller's job.

mod dispatcher;
mod error;
mod pattern;

pub use dispatcher::{DispatchReport, DispatcherConfig, EventDispatcher, HandlerFn};
pub use error::{DispatchError, DispatchResult, HandlerFailure};
pub use pattern::HandlerPattern;
