//! Startup configuration and logging for the outbox event worker.
//!
//! Every tunable is read from the environment once at startup and validated
//! against a documented range. Out-of-range or unparseable values are a
//! fatal [`ConfigError`]; nothing is silently clamped.

mod config;
mod error;
mod logging;

pub use config::{
    EventsConfig, HandlerSettings, LogFormat, PollerSettings, QueueSettings, DEFAULT_LOG_LEVEL,
    DEFAULT_QUEUE_NAME,
};
pub use error::{ConfigError, ConfigResult};
pub use logging::{init_logging, parse_level};
