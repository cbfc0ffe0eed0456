//! Behaviour every `OutboxStore` backend must share.

use chrono::{Duration, Utc};
use outbox_store::{
    EventStatus, InMemoryOutboxStore, NewOutboxEvent, OutboxStore, SqliteOutboxStore, StoreError,
};
use serde_json::json;
use std::sync::Arc;

async fn backends() -> Vec<(&'static str, Arc<dyn OutboxStore>)> {
    let sqlite = SqliteOutboxStore::open_in_memory(std::time::Duration::from_secs(30))
        .await
        .unwrap();
    let memory: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
    let sqlite: Arc<dyn OutboxStore> = Arc::new(sqlite);
    vec![("memory", memory), ("sqlite", sqlite)]
}

fn event(event_type: &str, aggregate_id: &str) -> NewOutboxEvent {
    NewOutboxEvent::new(
        event_type,
        "lead",
        aggregate_id,
        json!({"aggregate_id": aggregate_id}),
    )
}

#[tokio::test]
async fn lifecycle_from_pending_to_published() {
    for (name, store) in backends().await {
        let added = store.add_event(event("lead.created", "l-1")).await.unwrap();
        assert_eq!(added.status, EventStatus::Pending, "{}", name);

        let batch = store.fetch_pending_events(1).await.unwrap();
        assert_eq!(batch.len(), 1, "{}", name);
        assert_eq!(batch[0].id, added.id, "{}", name);

        store.mark_as_published(&added.id).await.unwrap();
        assert!(store.fetch_pending_events(10).await.unwrap().is_empty(), "{}", name);
        assert_eq!(store.pending_count().await.unwrap(), 0, "{}", name);
    }
}

#[tokio::test]
async fn fetched_event_claim_can_be_renewed() {
    for (name, store) in backends().await {
        let added = store.add_event(event("lead.created", "l-1")).await.unwrap();
        store.fetch_pending_events(1).await.unwrap();

        let lease = std::time::Duration::from_secs(30);
        assert!(store.renew_claim(&added.id, lease).await.unwrap(), "{}", name);
        store.mark_as_published(&added.id).await.unwrap();
    }
}

#[tokio::test]
async fn zero_limit_returns_empty_batch() {
    for (name, store) in backends().await {
        store.add_event(event("lead.created", "l-1")).await.unwrap();
        assert!(store.fetch_pending_events(0).await.unwrap().is_empty(), "{}", name);
    }
}

#[tokio::test]
async fn future_retry_is_not_fetched() {
    for (name, store) in backends().await {
        let due = store.add_event(event("lead.created", "l-1")).await.unwrap();
        let later = store.add_event(event("lead.updated", "l-2")).await.unwrap();

        store
            .schedule_retry(&later.id, 1, Utc::now() + Duration::minutes(5), "timeout")
            .await
            .unwrap();

        let ids: Vec<String> = store
            .fetch_pending_events(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![due.id], "{}", name);
        assert_eq!(store.pending_count().await.unwrap(), 2, "{}", name);
    }
}

#[tokio::test]
async fn dead_letter_removes_from_pending_set() {
    for (name, store) in backends().await {
        let added = store.add_event(event("lead.created", "l-1")).await.unwrap();
        store.move_to_dead_letter(&added.id, "handler exploded").await.unwrap();

        assert!(store.fetch_pending_events(10).await.unwrap().is_empty(), "{}", name);

        let stored = store.get_event_by_id(&added.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::DeadLettered, "{}", name);

        let entry = store.get_dead_letter(&added.id).await.unwrap().unwrap();
        assert_eq!(entry.reason, "handler exploded", "{}", name);
        assert_eq!(entry.event.id, added.id, "{}", name);
    }
}

#[tokio::test]
async fn unknown_ids_are_reported() {
    for (name, store) in backends().await {
        let err = store.mark_as_published("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)), "{}: {:?}", name, err);
        assert!(store.get_event_by_id("nope").await.unwrap().is_none(), "{}", name);
        assert!(store.get_dead_letter("nope").await.unwrap().is_none(), "{}", name);
    }
}
