//! Composition root: store, dispatcher, poller and queue connector.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use event_dispatcher::{DispatcherConfig, EventDispatcher};
use outbox_config::{EventsConfig, PollerSettings, QueueSettings};
use outbox_poller::{OutboxPoller, PollerConfig};
use outbox_store::{InMemoryOutboxStore, OutboxStore, SqliteOutboxStore};
use queue_connector::{HealthStatus, QueueConnector, QueueConnectorConfig};
use tracing::{info, warn};

use crate::handlers;

/// How long the worker keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run one cycle, report it, exit.
    Once,
    /// Poll until SIGINT/SIGTERM, logging status every `status_interval`.
    Continuous { status_interval: Duration },
}

pub async fn run(config: EventsConfig, mode: RunMode) -> anyhow::Result<()> {
    let poller_config = poller_config(&config.poller);
    poller_config
        .validate()
        .context("invalid poller configuration")?;

    let store = open_store(&config, poller_config.lock_timeout).await?;
    let dispatcher = EventDispatcher::new(DispatcherConfig {
        parallel: config.handlers.parallel,
        handler_timeout: config.handlers.timeout,
    });
    handlers::register_logging_handler(&dispatcher).await?;

    let connector = match &config.queue {
        Some(settings) => Some(connect_queue(settings, &dispatcher).await?),
        None => None,
    };

    let poller = OutboxPoller::new(Arc::clone(&store), dispatcher, poller_config);

    match mode {
        RunMode::Once => {
            let report = poller.poll_once().await;
            if let Some(connector) = &connector {
                connector.shutdown().await;
            }
            let report = report?;
            info!(
                fetched = report.fetched,
                published = report.published,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                store_errors = report.store_errors,
                skipped = report.skipped,
                "Poll cycle complete"
            );
        }
        RunMode::Continuous { status_interval } => {
            poller.start().await;
            info!(
                use_database = config.use_database,
                poll_interval_ms = config.poller.poll_interval.as_millis() as u64,
                queue = config.queue.as_ref().map(|q| q.queue_name.as_str()),
                "Outbox worker started"
            );

            let mut status_tick = tokio::time::interval(status_interval);
            status_tick.tick().await;
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = status_tick.tick() => {
                        log_status(&poller, store.as_ref(), connector.as_ref()).await;
                    }
                }
            }

            info!("Shutdown signal received, stopping outbox worker");
            poller.stop().await;
            if let Some(connector) = &connector {
                connector.shutdown().await;
            }
        }
    }

    let stats = poller.stats();
    info!(
        processed = stats.processed,
        failed = stats.failed,
        dlq = stats.dlq,
        "Outbox worker stopped"
    );
    Ok(())
}

fn poller_config(settings: &PollerSettings) -> PollerConfig {
    PollerConfig {
        poll_interval: settings.poll_interval,
        batch_size: settings.batch_size,
        lock_timeout: settings.lock_timeout,
        max_retries: settings.max_retries,
        retry_backoff: settings.retry_backoff.clone(),
        event_concurrency: settings.event_concurrency,
    }
}

async fn open_store(
    config: &EventsConfig,
    lock_timeout: Duration,
) -> anyhow::Result<Arc<dyn OutboxStore>> {
    if !config.use_database {
        info!("Using in-memory outbox store");
        return Ok(Arc::new(InMemoryOutboxStore::new()));
    }

    let store = SqliteOutboxStore::open(&config.database_path, lock_timeout)
        .await
        .with_context(|| {
            format!(
                "failed to open outbox database at {}",
                config.database_path.display()
            )
        })?;
    Ok(Arc::new(store))
}

async fn connect_queue(
    settings: &QueueSettings,
    dispatcher: &EventDispatcher,
) -> anyhow::Result<QueueConnector> {
    let connector = QueueConnector::new(QueueConnectorConfig::new(settings.redis_url.as_str()));
    connector
        .connect()
        .await
        .context("failed to connect to Redis")?;

    let queue = connector.get_queue(&settings.queue_name).await?;
    handlers::register_queue_forwarder(dispatcher, queue).await?;
    info!(queue = %settings.queue_name, "Forwarding outbox events to job queue");
    Ok(connector)
}

async fn log_status(
    poller: &OutboxPoller,
    store: &dyn OutboxStore,
    connector: Option<&QueueConnector>,
) {
    let stats = poller.stats();
    match store.pending_count().await {
        Ok(pending) => info!(
            processed = stats.processed,
            failed = stats.failed,
            dlq = stats.dlq,
            is_polling = stats.is_polling,
            pending,
            "Outbox status"
        ),
        Err(e) => warn!(error = %e, "Failed to count pending events"),
    }

    if let Some(connector) = connector {
        let health = connector.check_health().await;
        if health.status == HealthStatus::Ok {
            info!(latency_ms = ?health.latency_ms, "Queue connector healthy");
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
