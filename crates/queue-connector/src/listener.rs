//! Per-queue event listeners.

use crate::{QueueError, QueueEvent, QueueResult};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) type EventCallback = Arc<dyn Fn(QueueEvent) + Send + Sync>;

/// Task forwarding one queue's events to a callback.
pub(crate) struct QueueListener {
    queue: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl QueueListener {
    pub(crate) fn spawn(
        queue: &str,
        mut events: broadcast::Receiver<QueueEvent>,
        callback: EventCallback,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = queue.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    received = events.recv() => match received {
                        Ok(event) if event.queue() == name => callback(event),
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(queue = %name, skipped, "Queue listener lagged, events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(queue = %name, "Queue listener stopped");
        });

        Self {
            queue: queue.to_string(),
            shutdown_tx,
            handle,
        }
    }

    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) async fn close(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle
            .await
            .map_err(|e| QueueError::Worker(format!("listener for {} failed: {}", self.queue, e)))
    }
}
