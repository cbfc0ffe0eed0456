//! Durable job queue connector.
//!
//! Owns the lifecycle of everything that talks to Redis on behalf of the
//! outbox worker:
//!
//! ```text
//! QueueConnector
//!   ├── JobQueue     LPUSH onto <prefix>:<name>:wait
//!   ├── QueueWorker  BRPOP from <prefix>:<name>:wait, failures to <prefix>:<name>:failed
//!   ├── listeners    QueueEvent callbacks per queue name
//!   └── health       PING latency classified as ok / degraded / error
//! ```
//!
//! [`QueueConnector::shutdown`] closes workers, then listeners, then queues,
//! then the base connection. A failing step is logged and skipped.

mod config;
mod connector;
mod error;
mod health;
mod job;
mod listener;
mod queue;
mod worker;

pub use config::{QueueConnectorConfig, DEFAULT_KEY_PREFIX};
pub use connector::QueueConnector;
pub use error::{QueueError, QueueResult};
pub use health::{classify_latency, HealthReport, HealthStatus};
pub use job::{Job, QueueEvent};
pub use queue::JobQueue;
pub use worker::{JobProcessor, QueueWorker};
