//! Outbox event storage.
//!
//! Producers append events with [`OutboxStore::add_event`] (or, for SQLite,
//! [`sqlite::insert_event_tx`] inside their own transaction). The poller
//! fetches due events and records the outcome of each dispatch attempt.
//!
//! Two backends implement [`OutboxStore`]:
//! - [`InMemoryOutboxStore`]: single-process reference store
//! - [`SqliteOutboxStore`]: durable store that leases fetched rows so several
//!   pollers can share one database file

mod error;
mod memory;
mod model;
pub mod sqlite;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryOutboxStore;
pub use model::{DeadLetterEntry, EventMetadata, EventStatus, NewOutboxEvent, OutboxEvent};
pub use sqlite::SqliteOutboxStore;
pub use store::OutboxStore;
