//! In-memory outbox store.

use crate::model::now;
use crate::{
    DeadLetterEntry, EventStatus, NewOutboxEvent, OutboxEvent, OutboxStore, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Inner {
    /// Pending and published events with their insertion sequence.
    events: HashMap<String, (u64, OutboxEvent)>,
    dead_letters: HashMap<String, (u64, DeadLetterEntry)>,
    next_seq: u64,
}

impl Inner {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Process-local store for tests and single-process deployments.
///
/// Fetching does not claim events, so only one poller should drive it.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    inner: RwLock<Inner>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add_event(&self, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
        event.validate()?;
        let event = OutboxEvent::from_new(event);

        let mut inner = self.inner.write().await;
        let seq = inner.seq();
        inner.events.insert(event.id.clone(), (seq, event.clone()));

        debug!(event_id = %event.id, event_type = %event.event_type, "Event added to outbox");
        Ok(event)
    }

    async fn fetch_pending_events(&self, limit: usize) -> StoreResult<Vec<OutboxEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let at = now();
        let inner = self.inner.read().await;
        let mut due: Vec<&(u64, OutboxEvent)> = inner
            .events
            .values()
            .filter(|(_, event)| event.is_due(at))
            .collect();
        due.sort_by_key(|(seq, event)| (event.created_at, *seq));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn mark_as_published(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some((_, event)) = inner.events.get_mut(id) {
            if event.published_at.is_none() {
                event.status = EventStatus::Published;
                event.published_at = Some(now());
                event.next_retry_at = None;
            }
            return Ok(());
        }
        if inner.dead_letters.contains_key(id) {
            return Err(StoreError::invalid_state(id, EventStatus::DeadLettered));
        }
        Err(StoreError::NotFound(id.to_string()))
    }

    async fn schedule_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> StoreResult<()> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        match inner.events.get_mut(id) {
            Some((_, event)) if event.status == EventStatus::Pending => {
                event.retry_count = retry_count;
                event.next_retry_at = Some(next_retry_at.trunc_subsecs(3));
                event.last_error = Some(last_error.to_string());
                Ok(())
            }
            Some((_, event)) => Err(StoreError::invalid_state(id, event.status)),
            None if inner.dead_letters.contains_key(id) => {
                Err(StoreError::invalid_state(id, EventStatus::DeadLettered))
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn move_to_dead_letter(&self, id: &str, reason: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.dead_letters.contains_key(id) {
            return Ok(());
        }

        match inner.events.get(id) {
            None => return Err(StoreError::NotFound(id.to_string())),
            Some((_, event)) if event.status == EventStatus::Published => {
                return Err(StoreError::invalid_state(id, event.status));
            }
            Some(_) => {}
        }

        if let Some((_, event)) = inner.events.remove(id) {
            let seq = inner.seq();
            inner
                .dead_letters
                .insert(id.to_string(), (seq, DeadLetterEntry::new(event, reason)));
        }
        debug!(event_id = %id, reason, "Event moved to dead letter");
        Ok(())
    }

    async fn get_event_by_id(&self, id: &str) -> StoreResult<Option<OutboxEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .get(id)
            .map(|(_, event)| event.clone())
            .or_else(|| inner.dead_letters.get(id).map(|(_, e)| e.event.clone())))
    }

    async fn get_dead_letter(&self, id: &str) -> StoreResult<Option<DeadLetterEntry>> {
        let inner = self.inner.read().await;
        Ok(inner.dead_letters.get(id).map(|(_, entry)| entry.clone()))
    }

    async fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<DeadLetterEntry>> {
        let inner = self.inner.read().await;
        let mut entries: Vec<&(u64, DeadLetterEntry)> = inner.dead_letters.values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn pending_count(&self) -> StoreResult<usize> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .values()
            .filter(|(_, event)| event.status == EventStatus::Pending)
            .count())
    }
}
