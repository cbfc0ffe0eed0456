//! Poller configuration.

use crate::{PollerError, PollerResult};
use std::time::Duration;

/// Configuration for polling cadence and retry behavior.
///
/// # Backoff
///
/// The delay before retry `n` (zero-based, equal to the event's current
/// `retry_count`) is `retry_backoff[n]`. When the list is shorter than the
/// retry budget the last entry is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Interval between fetch cycles.
    pub poll_interval: Duration,
    /// Maximum events fetched per cycle.
    pub batch_size: usize,
    /// Lease length a claiming store grants on each renewal. While an event
    /// is being dispatched its claim is renewed every third of this.
    pub lock_timeout: Duration,
    /// Attempts before an event is dead-lettered.
    pub max_retries: u32,
    /// Retry delays indexed by attempt.
    pub retry_backoff: Vec<Duration>,
    /// Events of one batch in flight at the same time.
    pub event_concurrency: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            lock_timeout: Duration::from_millis(30_000),
            max_retries: 3,
            retry_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ],
            event_concurrency: 1,
        }
    }
}

impl PollerConfig {
    /// Delay before the next attempt of an event that has failed `retry_count` times before.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let Some(last) = self.retry_backoff.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (retry_count as usize).min(last);
        self.retry_backoff[index]
    }

    /// Whether one more failure exhausts the retry budget.
    pub fn is_last_attempt(&self, retry_count: u32) -> bool {
        retry_count.saturating_add(1) >= self.max_retries
    }

    /// How often an in-flight event's claim is renewed.
    pub fn renew_interval(&self) -> Duration {
        (self.lock_timeout / 3).max(Duration::from_millis(1))
    }

    pub fn validate(&self) -> PollerResult<()> {
        if self.poll_interval.is_zero() {
            return Err(PollerError::Config("poll_interval must be positive".into()));
        }
        if self.lock_timeout.is_zero() {
            return Err(PollerError::Config("lock_timeout must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(PollerError::Config("batch_size must be positive".into()));
        }
        if self.max_retries == 0 {
            return Err(PollerError::Config("max_retries must be positive".into()));
        }
        if self.event_concurrency == 0 {
            return Err(PollerError::Config("event_concurrency must be positive".into()));
        }
        Ok(())
    }
}
