//! Connection lifecycle and registry of queues, workers and listeners.

use crate::listener::{EventCallback, QueueListener};
use crate::worker::{JobProcessor, WorkerContext};
use crate::{
    HealthReport, HealthStatus, Job, JobQueue, QueueConnectorConfig, QueueError, QueueEvent,
    QueueResult, QueueWorker,
};
use futures_util::FutureExt;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

struct Connection {
    client: Client,
    conn: MultiplexedConnection,
}

/// Owns the Redis client and everything built on top of it.
pub struct QueueConnector {
    config: QueueConnectorConfig,
    connection: RwLock<Option<Connection>>,
    queues: Mutex<HashMap<String, Arc<JobQueue>>>,
    workers: Mutex<HashMap<String, Arc<QueueWorker>>>,
    listeners: Mutex<Vec<QueueListener>>,
    events: broadcast::Sender<QueueEvent>,
    last_health: RwLock<Option<HealthReport>>,
}

impl QueueConnector {
    pub fn new(config: QueueConnectorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            connection: RwLock::new(None),
            queues: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            events,
            last_health: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &QueueConnectorConfig {
        &self.config
    }

    /// Open the client and base connection. A no-op when already connected.
    pub async fn connect(&self) -> QueueResult<()> {
        let mut connection = self.connection.write().await;
        if connection.is_some() {
            return Ok(());
        }

        debug!(key_prefix = %self.config.key_prefix, "Connecting to Redis");
        let client = Client::open(self.config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        *connection = Some(Connection { client, conn });

        info!(key_prefix = %self.config.key_prefix, "Connected to Redis");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    async fn base_connection(&self) -> QueueResult<(Client, MultiplexedConnection)> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|c| (c.client.clone(), c.conn.clone()))
            .ok_or(QueueError::NotConnected)
    }

    /// Queue handle for `name`, created on first use.
    pub async fn get_queue(&self, name: &str) -> QueueResult<Arc<JobQueue>> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(name).filter(|queue| !queue.is_closed()) {
            return Ok(Arc::clone(queue));
        }

        let (_, conn) = self.base_connection().await?;
        let queue = Arc::new(JobQueue::new(name, self.config.wait_key(name), conn));
        queues.insert(name.to_string(), Arc::clone(&queue));
        debug!(queue = %name, key = %queue.key(), "Created job queue");
        Ok(queue)
    }

    /// Worker for `name`, created on first use.
    ///
    /// If a worker already exists for the queue it is returned and
    /// `processor` is dropped.
    pub async fn create_worker<F, Fut>(&self, name: &str, processor: F) -> QueueResult<Arc<QueueWorker>>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get(name) {
            debug!(queue = %name, "Reusing existing queue worker");
            return Ok(Arc::clone(worker));
        }

        let (client, conn) = self.base_connection().await?;
        let blocking_conn = client.get_multiplexed_async_connection().await?;
        let processor: JobProcessor = Arc::new(move |job| processor(job).boxed());

        let worker = Arc::new(QueueWorker::spawn(WorkerContext {
            queue: name.to_string(),
            wait_key: self.config.wait_key(name),
            failed_key: self.config.failed_key(name),
            blocking_conn,
            conn,
            processor,
            concurrency: self.config.worker_concurrency,
            block_timeout: self.config.block_timeout,
            events: self.events.clone(),
        }));
        workers.insert(name.to_string(), Arc::clone(&worker));
        Ok(worker)
    }

    /// Call `callback` for every completion or failure on queue `name`.
    pub async fn listen<F>(&self, name: &str, callback: F)
    where
        F: Fn(QueueEvent) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        let listener = QueueListener::spawn(name, self.events.subscribe(), callback);
        self.listeners.lock().await.push(listener);
        debug!(queue = %name, "Registered queue listener");
    }

    /// Ping Redis and classify the round trip. The report is cached.
    pub async fn check_health(&self) -> HealthReport {
        let report = match self.base_connection().await {
            Err(_) => HealthReport::error("not connected"),
            Ok((_, mut conn)) => {
                let started = Instant::now();
                let ping = tokio::time::timeout(self.config.error_latency, async {
                    let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
                    Ok::<_, redis::RedisError>(pong)
                })
                .await;

                match ping {
                    Ok(Ok(_)) => HealthReport::from_latency(
                        started.elapsed(),
                        self.config.degraded_latency,
                        self.config.error_latency,
                    ),
                    Ok(Err(e)) => HealthReport::error(format!("ping failed: {}", e)),
                    Err(_) => HealthReport::error(format!(
                        "ping timed out after {}ms",
                        self.config.error_latency.as_millis()
                    )),
                }
            }
        };

        if report.status != HealthStatus::Ok {
            warn!(
                status = ?report.status,
                latency_ms = ?report.latency_ms,
                message = ?report.message,
                "Queue connector health check"
            );
        }
        *self.last_health.write().await = Some(report.clone());
        report
    }

    pub async fn last_health(&self) -> Option<HealthReport> {
        self.last_health.read().await.clone()
    }

    /// Close workers, then listeners, then queues, then the base connection.
    ///
    /// Failures are logged and the sequence continues.
    pub async fn shutdown(&self) {
        info!("Shutting down queue connector");

        let workers: Vec<(String, Arc<QueueWorker>)> = self.workers.lock().await.drain().collect();
        for (name, worker) in workers {
            if let Err(e) = worker.close().await {
                warn!(queue = %name, error = %e, "Failed to close queue worker");
            }
        }

        let listeners = std::mem::take(&mut *self.listeners.lock().await);
        for listener in listeners {
            let queue = listener.queue().to_string();
            if let Err(e) = listener.close().await {
                warn!(queue = %queue, error = %e, "Failed to close queue listener");
            }
        }

        let queues: Vec<(String, Arc<JobQueue>)> = self.queues.lock().await.drain().collect();
        for (_, queue) in queues {
            queue.close();
        }

        if self.connection.write().await.take().is_some() {
            debug!("Redis connection closed");
        }
        info!("Queue connector shut down");
    }

    #[cfg(test)]
    pub(crate) fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for QueueConnector {
    fn default() -> Self {
        Self::new(QueueConnectorConfig::default())
    }
}
