//! Poller counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative poller statistics since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    /// Events published.
    pub processed: u64,
    /// Failed attempts that were rescheduled.
    pub failed: u64,
    /// Events moved to the dead-letter partition.
    pub dlq: u64,
    pub is_polling: bool,
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Events whose outcome could not be written; they stay as they were.
    pub store_errors: usize,
    /// Events another poller claimed before this one got to them.
    pub skipped: usize,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.fetched == 0
    }
}

/// What happened to one event in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Published,
    Retried,
    DeadLettered,
    StoreError,
    Skipped,
}

impl CycleReport {
    pub(crate) fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Published => self.published += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
            Outcome::StoreError => self.store_errors += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    dlq: AtomicU64,
}

impl Counters {
    /// Count an event once its outcome is persisted. Store errors and
    /// skipped events are not counted.
    pub(crate) fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Published => &self.processed,
            Outcome::Retried => &self.failed,
            Outcome::DeadLettered => &self.dlq,
            Outcome::StoreError | Outcome::Skipped => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, is_polling: bool) -> PollerStats {
        PollerStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dlq: self.dlq.load(Ordering::Relaxed),
            is_polling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_skip_store_errors() {
        let counters = Counters::default();
        for outcome in [
            Outcome::Published,
            Outcome::Published,
            Outcome::Retried,
            Outcome::DeadLettered,
            Outcome::StoreError,
            Outcome::Skipped,
        ] {
            counters.record(outcome);
        }

        let stats = counters.snapshot(true);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dlq, 1);
        assert!(stats.is_polling);
    }

    #[test]
    fn report_tallies_outcomes() {
        let mut report = CycleReport {
            fetched: 3,
            ..CycleReport::default()
        };
        report.add(Outcome::Published);
        report.add(Outcome::StoreError);
        report.add(Outcome::Retried);
        report.add(Outcome::Skipped);
        assert_eq!(report.published, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.store_errors, 1);
        assert_eq!(report.retried, 1);
        assert!(!report.is_empty());
    }

    #[test]
    fn stats_serialize_as_flat_object() {
        let json = serde_json::to_value(PollerStats::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"processed": 0, "failed": 0, "dlq": 0, "is_polling": false})
        );
    }
}
