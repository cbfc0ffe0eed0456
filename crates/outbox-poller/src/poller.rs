//! The polling loop.

use crate::stats::{Counters, Outcome};
use crate::{CycleReport, PollerConfig, PollerResult, PollerStats};
use chrono::Utc;
use event_dispatcher::{DispatchReport, DispatchResult, EventDispatcher};
use futures_util::stream::{self, StreamExt};
use outbox_store::{OutboxEvent, OutboxStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

struct PollerInner {
    store: Arc<dyn OutboxStore>,
    dispatcher: EventDispatcher,
    config: PollerConfig,
    counters: Counters,
    is_polling: AtomicBool,
    /// Held for the duration of a cycle so cycles never overlap.
    cycle: Mutex<()>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Drains the outbox through the dispatcher on a fixed interval.
///
/// # Lifecycle
///
/// 1. Create with [`OutboxPoller::new()`]
/// 2. [`start()`](Self::start) spawns the background loop (idempotent)
/// 3. [`stop()`](Self::stop) lets the in-flight cycle finish, then ends the loop (idempotent)
pub struct OutboxPoller {
    inner: Arc<PollerInner>,
    running: Mutex<Option<Running>>,
}

impl OutboxPoller {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        dispatcher: EventDispatcher,
        config: PollerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                store,
                dispatcher,
                config,
                counters: Counters::default(),
                is_polling: AtomicBool::new(false),
                cycle: Mutex::new(()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.inner.config
    }

    /// Spawn the polling loop. Returns false when it was already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Outbox poller already running");
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        inner.is_polling.store(true, Ordering::SeqCst);

        info!(
            poll_interval_ms = inner.config.poll_interval.as_millis() as u64,
            batch_size = inner.config.batch_size,
            max_retries = inner.config.max_retries,
            event_concurrency = inner.config.event_concurrency,
            "Starting outbox poller"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = interval(inner.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        // Errors are logged inside; the loop keeps going.
                        let _ = inner.run_cycle().await;
                    }
                }
            }

            debug!("Outbox poller loop exited");
        });

        *running = Some(Running {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Stop the polling loop after the in-flight cycle completes.
    /// Returns false when it was not running.
    pub async fn stop(&self) -> bool {
        let Some(Running {
            shutdown_tx,
            handle,
        }) = self.running.lock().await.take()
        else {
            return false;
        };

        let _ = shutdown_tx.send(true);
        if let Err(e) = handle.await {
            error!(error = %e, "Outbox poller task ended abnormally");
        }
        self.inner.is_polling.store(false, Ordering::SeqCst);

        let stats = self.stats();
        info!(
            processed = stats.processed,
            failed = stats.failed,
            dlq = stats.dlq,
            "Outbox poller stopped"
        );
        true
    }

    /// Run one cycle now. Waits if a cycle is already in progress.
    pub async fn poll_once(&self) -> PollerResult<CycleReport> {
        self.inner.run_cycle().await
    }

    pub fn stats(&self) -> PollerStats {
        self.inner
            .counters
            .snapshot(self.inner.is_polling.load(Ordering::SeqCst))
    }
}

impl PollerInner {
    async fn run_cycle(&self) -> PollerResult<CycleReport> {
        let _cycle = self.cycle.lock().await;

        let events = match self.store.fetch_pending_events(self.config.batch_size).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Failed to fetch pending outbox events");
                return Err(e.into());
            }
        };

        let mut report = CycleReport {
            fetched: events.len(),
            ..CycleReport::default()
        };
        if events.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<Outcome> = stream::iter(events)
            .map(|event| self.process_event(event))
            .buffer_unordered(self.config.event_concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            report.add(outcome);
        }

        debug!(
            fetched = report.fetched,
            published = report.published,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            store_errors = report.store_errors,
            skipped = report.skipped,
            "Outbox poll cycle complete"
        );
        Ok(report)
    }

    async fn process_event(&self, event: OutboxEvent) -> Outcome {
        let outcome = match self.store.renew_claim(&event.id, self.config.lock_timeout).await {
            Ok(true) => match self.dispatch_holding_claim(&event).await {
                Ok(_) => self.publish(&event).await,
                Err(e) => self.handle_failure(&event, &e.to_string()).await,
            },
            Ok(false) => {
                debug!(event_id = %event.id, "Event claimed by another poller, skipping");
                Outcome::Skipped
            }
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Failed to renew event claim");
                Outcome::StoreError
            }
        };
        self.counters.record(outcome);
        outcome
    }

    /// Dispatch while renewing the event's claim, so a slow dispatch never
    /// outlives its lease.
    async fn dispatch_holding_claim(
        &self,
        event: &OutboxEvent,
    ) -> DispatchResult<DispatchReport> {
        let every = self.config.renew_interval();
        let mut renew = interval_at(Instant::now() + every, every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let dispatch = self.dispatcher.dispatch(event);
        tokio::pin!(dispatch);

        loop {
            tokio::select! {
                result = &mut dispatch => return result,
                _ = renew.tick() => {
                    match self.store.renew_claim(&event.id, self.config.lock_timeout).await {
                        Ok(true) => {}
                        Ok(false) => warn!(event_id = %event.id, "Event claim lost during dispatch"),
                        Err(e) => warn!(event_id = %event.id, error = %e, "Failed to renew event claim"),
                    }
                }
            }
        }
    }

    async fn publish(&self, event: &OutboxEvent) -> Outcome {
        match self.store.mark_as_published(&event.id).await {
            Ok(()) => {
                debug!(event_id = %event.id, event_type = %event.event_type, "Event published");
                Outcome::Published
            }
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Failed to mark event as published");
                Outcome::StoreError
            }
        }
    }

    async fn handle_failure(&self, event: &OutboxEvent, reason: &str) -> Outcome {
        if self.config.is_last_attempt(event.retry_count) {
            return match self.store.move_to_dead_letter(&event.id, reason).await {
                Ok(()) => {
                    warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        attempts = event.retry_count + 1,
                        reason,
                        "Event dead-lettered after exhausting retries"
                    );
                    Outcome::DeadLettered
                }
                Err(e) => {
                    error!(event_id = %event.id, error = %e, "Failed to dead-letter event");
                    Outcome::StoreError
                }
            };
        }

        let delay = self.config.backoff_for(event.retry_count);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        let retry_count = event.retry_count + 1;

        match self
            .store
            .schedule_retry(&event.id, retry_count, next_retry_at, reason)
            .await
        {
            Ok(()) => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    reason,
                    "Event dispatch failed, retry scheduled"
                );
                Outcome::Retried
            }
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Failed to schedule event retry");
                Outcome::StoreError
            }
        }
    }
}
