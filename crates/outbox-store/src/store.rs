//! The storage contract shared by every backend.

use crate::{DeadLetterEntry, NewOutboxEvent, OutboxEvent, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Durable pending set with retry bookkeeping and a dead-letter partition.
///
/// Each operation is atomic with respect to a single event id. A failed write
/// leaves the previously persisted state of the event untouched.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Validate and insert a new pending event.
    async fn add_event(&self, event: NewOutboxEvent) -> StoreResult<OutboxEvent>;

    /// Up to `limit` due events, oldest first.
    ///
    /// Leasing backends claim the returned rows so that other pollers skip
    /// them until the lease expires or the outcome is written.
    async fn fetch_pending_events(&self, limit: usize) -> StoreResult<Vec<OutboxEvent>>;

    /// Re-check and extend this store's claim on a fetched event.
    ///
    /// Returns false when another poller has claimed the event since it was
    /// fetched, or it is no longer pending; the caller must then leave it
    /// alone. Backends without leases always return true.
    async fn renew_claim(&self, _id: &str, _lease: Duration) -> StoreResult<bool> {
        Ok(true)
    }

    /// Mark an event delivered. Calling it again keeps the first `published_at`.
    async fn mark_as_published(&self, id: &str) -> StoreResult<()>;

    /// Record a failed attempt and hide the event until `next_retry_at`.
    async fn schedule_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> StoreResult<()>;

    /// Remove the event from the pending set and park it in the dead-letter
    /// partition. A second call for the same id is a no-op.
    async fn move_to_dead_letter(&self, id: &str, reason: &str) -> StoreResult<()>;

    /// Look up an event in any state. Dead-lettered events come back tagged
    /// [`EventStatus::DeadLettered`](crate::EventStatus::DeadLettered).
    async fn get_event_by_id(&self, id: &str) -> StoreResult<Option<OutboxEvent>>;

    async fn get_dead_letter(&self, id: &str) -> StoreResult<Option<DeadLetterEntry>>;

    /// Up to `limit` dead-letter entries, oldest first.
    async fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<DeadLetterEntry>>;

    /// Number of events still pending, due or not.
    async fn pending_count(&self) -> StoreResult<usize>;
}
