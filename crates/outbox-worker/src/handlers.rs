//! Built-in event handlers.

use event_dispatcher::{DispatchResult, EventDispatcher};
use queue_connector::JobQueue;
use std::sync::Arc;
use tracing::{debug, info};

/// Log every dispatched event.
pub async fn register_logging_handler(dispatcher: &EventDispatcher) -> DispatchResult<()> {
    dispatcher
        .register_named("*", "event-logger", |event| async move {
            info!(
                event_id = %event.id,
                event_type = %event.event_type,
                aggregate_type = %event.aggregate_type,
                aggregate_id = %event.aggregate_id,
                correlation_id = %event.metadata.correlation_id,
                retry_count = event.retry_count,
                "Dispatching outbox event"
            );
            Ok(())
        })
        .await
}

/// Forward every event to a durable job queue, job name = event type.
pub async fn register_queue_forwarder(
    dispatcher: &EventDispatcher,
    queue: Arc<JobQueue>,
) -> DispatchResult<()> {
    dispatcher
        .register_named("*", "queue-forwarder", move |event| {
            let queue = Arc::clone(&queue);
            async move {
                let data = serde_json::to_value(&*event)?;
                let job_id = queue.enqueue(&event.event_type, data).await?;
                debug!(event_id = %event.id, job_id = %job_id, queue = %queue.name(), "Event forwarded to queue");
                Ok(())
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_dispatcher::DispatchError;
    use outbox_store::{InMemoryOutboxStore, NewOutboxEvent, OutboxStore};
    use serde_json::json;

    #[tokio::test]
    async fn logging_handler_accepts_every_event() {
        let dispatcher = EventDispatcher::default();
        register_logging_handler(&dispatcher).await.unwrap();
        assert_eq!(dispatcher.handler_count().await, 1);

        let store = InMemoryOutboxStore::new();
        let event = store
            .add_event(NewOutboxEvent::new(
                "lead.created",
                "lead",
                "l-1",
                json!({"lead_id": "l-1"}),
            ))
            .await
            .unwrap();

        let report = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(report.handlers_run, 1);
    }

    #[tokio::test]
    async fn logging_handler_registers_once() {
        let dispatcher = EventDispatcher::default();
        register_logging_handler(&dispatcher).await.unwrap();
        let err = register_logging_handler(&dispatcher).await.unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateHandler(_)));
    }
}
