//! Configuration for the queue connector.

use std::time::Duration;

/// Default prefix for every Redis key the connector touches.
pub const DEFAULT_KEY_PREFIX: &str = "outbox-queue";

/// Queue connector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConnectorConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Prefix for queue keys
    pub key_prefix: String,

    /// Jobs a single worker runs at the same time
    pub worker_concurrency: usize,

    /// BRPOP block timeout; also bounds how long a worker takes to notice close
    pub block_timeout: Duration,

    /// Ping latency at or above which health is degraded
    pub degraded_latency: Duration,

    /// Ping latency at or above which health is an error
    pub error_latency: Duration,

    /// Buffered queue events per listener before old ones are dropped
    pub event_capacity: usize,
}

impl QueueConnectorConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            ..Self::default()
        }
    }

    /// List holding jobs waiting to be processed.
    pub fn wait_key(&self, queue: &str) -> String {
        format!("{}:{}:wait", self.key_prefix, queue)
    }

    /// List holding jobs whose processor failed.
    pub fn failed_key(&self, queue: &str) -> String {
        format!("{}:{}:failed", self.key_prefix, queue)
    }
}

impl Default for QueueConnectorConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            worker_concurrency: 4,
            block_timeout: Duration::from_secs(1),
            degraded_latency: Duration::from_millis(100),
            error_latency: Duration::from_millis(1000),
            event_capacity: 256,
        }
    }
}
