//! Consumer side of a job queue.
//!
//! A worker blocks on `BRPOP` over a dedicated connection so the shared
//! connection stays free for producers. Each popped job runs on its own
//! task; a semaphore caps how many run at once and a permit is taken before
//! popping, so a saturated worker leaves jobs in Redis.

use crate::{Job, QueueError, QueueEvent, QueueResult};
use futures_util::future::BoxFuture;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Boxed async job processor.
pub type JobProcessor = Arc<dyn Fn(Job) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub(crate) struct WorkerContext {
    pub(crate) queue: String,
    pub(crate) wait_key: String,
    pub(crate) failed_key: String,
    /// Dedicated connection for the blocking pop.
    pub(crate) blocking_conn: MultiplexedConnection,
    /// Shared connection for writes.
    pub(crate) conn: MultiplexedConnection,
    pub(crate) processor: JobProcessor,
    pub(crate) concurrency: usize,
    pub(crate) block_timeout: Duration,
    pub(crate) events: broadcast::Sender<QueueEvent>,
}

/// Background consumer for one queue.
pub struct QueueWorker {
    queue: String,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueWorker {
    pub(crate) fn spawn(ctx: WorkerContext) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = ctx.queue.clone();
        info!(queue = %queue, concurrency = ctx.concurrency, "Starting queue worker");
        let handle = tokio::spawn(run(Arc::new(ctx), shutdown_rx));

        Self {
            queue,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Stop pulling jobs and wait for in-flight jobs to settle.
    pub async fn close(&self) -> QueueResult<()> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(());
        };
        let _ = self.shutdown_tx.send(true);
        handle
            .await
            .map_err(|e| QueueError::Worker(format!("worker for {} failed: {}", self.queue, e)))?;
        info!(queue = %self.queue, "Queue worker stopped");
        Ok(())
    }
}

async fn run(ctx: Arc<WorkerContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let concurrency = ctx.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut conn = ctx.blocking_conn.clone();
    let block_timeout = ctx.block_timeout.as_secs_f64();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let popped: Option<(String, String)> = match conn.brpop(&ctx.wait_key, block_timeout).await {
            Ok(popped) => popped,
            Err(e) => {
                warn!(queue = %ctx.queue, error = %e, "BRPOP failed, backing off");
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(ctx.block_timeout) => continue,
                }
            }
        };
        let Some((_, payload)) = popped else {
            continue;
        };

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            ctx.process(payload).await;
            drop(permit);
        });
    }

    // Every permit back means every job task has finished.
    let _ = semaphore.acquire_many(concurrency as u32).await;
    debug!(queue = %ctx.queue, "Queue worker drained");
}

impl WorkerContext {
    async fn process(&self, payload: String) {
        let mut job: Job = match serde_json::from_str(&payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Discarding malformed job");
                self.push_failed(payload).await;
                return;
            }
        };

        let error = match tokio::spawn((self.processor)(job.clone())).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(e) if e.is_panic() => Some("job processor panicked".to_string()),
            Err(_) => Some("job processor was cancelled".to_string()),
        };

        let event = match error {
            None => {
                debug!(queue = %self.queue, job_id = %job.id, job_name = %job.name, "Job completed");
                QueueEvent::Completed {
                    queue: self.queue.clone(),
                    job_id: job.id,
                }
            }
            Some(error) => {
                warn!(queue = %self.queue, job_id = %job.id, job_name = %job.name, error = %error, "Job failed");
                job.attempts += 1;
                job.last_error = Some(error.clone());
                match serde_json::to_string(&job) {
                    Ok(payload) => self.push_failed(payload).await,
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to serialize failed job"),
                }
                QueueEvent::Failed {
                    queue: self.queue.clone(),
                    job_id: job.id,
                    error,
                }
            }
        };

        // No listeners is fine.
        let _ = self.events.send(event);
    }

    async fn push_failed(&self, payload: String) {
        let mut conn = self.conn.clone();
        let pushed: redis::RedisResult<i64> = conn.lpush(&self.failed_key, payload).await;
        if let Err(e) = pushed {
            warn!(queue = %self.queue, error = %e, "Failed to record failed job");
        }
    }
}
