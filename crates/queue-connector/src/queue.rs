//! Producer side of a job queue.

use crate::{Job, QueueError, QueueResult};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Handle for pushing jobs onto one named queue.
pub struct JobQueue {
    name: String,
    wait_key: String,
    conn: MultiplexedConnection,
    closed: AtomicBool,
}

impl JobQueue {
    pub(crate) fn new(name: &str, wait_key: String, conn: MultiplexedConnection) -> Self {
        Self {
            name: name.to_string(),
            wait_key,
            conn,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Redis list the jobs are pushed onto.
    pub fn key(&self) -> &str {
        &self.wait_key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push a job and return its id.
    pub async fn enqueue(&self, job_name: &str, data: serde_json::Value) -> QueueResult<String> {
        if self.is_closed() {
            return Err(QueueError::Closed(self.name.clone()));
        }

        let job = Job::new(job_name, data);
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        let backlog: i64 = conn.lpush(&self.wait_key, payload).await?;

        debug!(queue = %self.name, job_id = %job.id, job_name, backlog, "Job enqueued");
        Ok(job.id)
    }

    /// Jobs waiting to be picked up by a worker.
    pub async fn len(&self) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.wait_key).await?;
        Ok(len)
    }

    pub async fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Reject further enqueues. Returns false if already closed.
    pub fn close(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);
        if was_open {
            debug!(queue = %self.name, "Queue closed");
        }
        was_open
    }
}
