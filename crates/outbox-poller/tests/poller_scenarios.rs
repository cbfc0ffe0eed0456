//! End-to-end poller scenarios across store, dispatcher and poller.

use anyhow::anyhow;
use event_dispatcher::{DispatcherConfig, EventDispatcher};
use outbox_poller::{OutboxPoller, PollerConfig};
use outbox_store::{
    EventStatus, InMemoryOutboxStore, NewOutboxEvent, OutboxStore, SqliteOutboxStore,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

fn lead_event(action: &str, id: &str) -> NewOutboxEvent {
    NewOutboxEvent::new(
        format!("lead.{}", action),
        "lead",
        id,
        json!({"lead_id": id, "source": "web"}),
    )
}

fn immediate_retry_config() -> PollerConfig {
    PollerConfig {
        poll_interval: Duration::from_millis(20),
        retry_backoff: vec![Duration::ZERO],
        ..PollerConfig::default()
    }
}

async fn counting_dispatcher(calls: Arc<AtomicUsize>) -> EventDispatcher {
    let dispatcher = EventDispatcher::default();
    dispatcher
        .register("*", move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
    dispatcher
}

#[tokio::test]
async fn one_cycle_publishes_every_event() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = counting_dispatcher(Arc::clone(&calls)).await;

    let first = store.add_event(lead_event("created", "l-1")).await.unwrap();
    let second = store.add_event(lead_event("updated", "l-2")).await.unwrap();

    let poller = OutboxPoller::new(store.clone(), dispatcher, immediate_retry_config());
    let report = poller.poll_once().await.unwrap();

    assert_eq!(report.published, 2);
    assert_eq!(poller.stats().processed, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    for id in [first.id, second.id] {
        let stored = store.get_event_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Published);
        assert!(stored.published_at.is_some());
    }
}

#[tokio::test]
async fn failing_handler_dead_letters_after_max_retries() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let dispatcher = EventDispatcher::default();
    dispatcher
        .register("lead.created", |_| async { Err(anyhow!("CRM rejected the lead")) })
        .await
        .unwrap();
    let event = store.add_event(lead_event("created", "l-1")).await.unwrap();

    let poller = OutboxPoller::new(store.clone(), dispatcher, immediate_retry_config());
    for _ in 0..3 {
        poller.poll_once().await.unwrap();
    }

    let stats = poller.stats();
    assert_eq!(stats.dlq, 1);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.processed, 0);

    assert!(store.fetch_pending_events(10).await.unwrap().is_empty());
    let stored = store.get_event_by_id(&event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::DeadLettered);
    assert_eq!(stored.retry_count, 2);
    assert!(stored
        .last_error
        .unwrap()
        .contains("CRM rejected the lead"));

    // Terminal: further cycles leave it alone.
    assert_eq!(poller.poll_once().await.unwrap().fetched, 0);
    assert_eq!(poller.stats().dlq, 1);
}

#[tokio::test]
async fn rescheduled_event_waits_for_backoff() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let dispatcher = EventDispatcher::default();
    dispatcher
        .register("lead.*", |_| async { Err(anyhow!("temporary outage")) })
        .await
        .unwrap();
    store.add_event(lead_event("created", "l-1")).await.unwrap();

    let config = PollerConfig {
        retry_backoff: vec![Duration::from_millis(200)],
        ..immediate_retry_config()
    };
    let poller = OutboxPoller::new(store.clone(), dispatcher, config);

    assert_eq!(poller.poll_once().await.unwrap().retried, 1);
    assert!(store.fetch_pending_events(10).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.fetch_pending_events(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn timed_out_handler_is_retried() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let dispatcher = EventDispatcher::new(DispatcherConfig {
        parallel: true,
        handler_timeout: Duration::from_millis(50),
    });
    dispatcher
        .register("lead.created", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap();
    let event = store.add_event(lead_event("created", "l-1")).await.unwrap();

    let poller = OutboxPoller::new(store.clone(), dispatcher, immediate_retry_config());
    let report = poller.poll_once().await.unwrap();
    assert_eq!(report.retried, 1);

    let stored = store.get_event_by_id(&event.id).await.unwrap().unwrap();
    assert!(stored.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn running_loop_picks_up_new_events() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = counting_dispatcher(Arc::clone(&calls)).await;
    let poller = OutboxPoller::new(store.clone(), dispatcher, immediate_retry_config());

    assert!(poller.start().await);
    assert!(!poller.start().await);

    for i in 0..5 {
        store
            .add_event(lead_event("created", &format!("l-{}", i)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(poller.stop().await);

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(poller.stats().processed, 5);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn sqlite_pollers_share_work_without_duplicates() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("outbox.db");
    let lease = Duration::from_secs(30);

    let producer = SqliteOutboxStore::open(&db_path, lease).await.unwrap();
    for i in 0..20 {
        producer
            .add_event(lead_event("created", &format!("l-{}", i)))
            .await
            .unwrap();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let config = PollerConfig {
        batch_size: 5,
        ..immediate_retry_config()
    };

    let mut pollers = Vec::new();
    for _ in 0..2 {
        let store = SqliteOutboxStore::open(&db_path, lease).await.unwrap();
        let dispatcher = counting_dispatcher(Arc::clone(&calls)).await;
        pollers.push(OutboxPoller::new(Arc::new(store), dispatcher, config.clone()));
    }

    for poller in &pollers {
        assert!(poller.start().await);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    for poller in &pollers {
        assert!(poller.stop().await);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 20);
    let processed: u64 = pollers.iter().map(|p| p.stats().processed).sum();
    assert_eq!(processed, 20);
    assert_eq!(producer.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn slow_batch_is_not_redispatched_by_second_poller() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("outbox.db");
    let lease = Duration::from_millis(300);

    let producer = SqliteOutboxStore::open(&db_path, lease).await.unwrap();
    let mut ids = Vec::new();
    for i in 0..4 {
        let event = producer
            .add_event(lead_event("created", &format!("l-{}", i)))
            .await
            .unwrap();
        ids.push(event.id);
    }

    let dispatches: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let config = PollerConfig {
        lock_timeout: lease,
        batch_size: 4,
        ..immediate_retry_config()
    };

    let mut pollers = Vec::new();
    for _ in 0..2 {
        let store = SqliteOutboxStore::open(&db_path, lease).await.unwrap();
        let dispatcher = EventDispatcher::default();
        let seen = Arc::clone(&dispatches);
        dispatcher
            .register("*", move |event| {
                let seen = Arc::clone(&seen);
                async move {
                    *seen.lock().unwrap().entry(event.id.clone()).or_default() += 1;
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(())
                }
            })
            .await
            .unwrap();
        pollers.push(Arc::new(OutboxPoller::new(
            Arc::new(store),
            dispatcher,
            config.clone(),
        )));
    }

    // The first poller claims the whole batch; working through it takes
    // longer than one lease.
    let first = Arc::clone(&pollers[0]);
    let first_cycle = tokio::spawn(async move { first.poll_once().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(350)).await;
    let second = pollers[1].poll_once().await.unwrap();
    let first = first_cycle.await.unwrap();

    let dispatches = dispatches.lock().unwrap().clone();
    for id in &ids {
        assert_eq!(dispatches.get(id), Some(&1), "event {} dispatched {:?}", id, dispatches);
    }
    assert_eq!(first.published + second.published, 4);
    let processed: u64 = pollers.iter().map(|p| p.stats().processed).sum();
    assert_eq!(processed, 4);
    assert_eq!(producer.pending_count().await.unwrap(), 0);
}
