//! SQLite outbox store.
//!
//! All statements run on the single executor thread owned by
//! `tokio_rusqlite::Connection`. Fetching claims rows with a lease
//! (`locked_by`, `locked_until`) inside one `IMMEDIATE` transaction, so any
//! number of pollers, in one process or several, can share a database file.
//! A poller that dies mid-batch loses its claim once the lease expires.
//!
//! Timestamps are stored as RFC 3339 UTC strings with millisecond precision,
//! which keeps lexical and temporal order identical.

mod migrations;

pub use migrations::{run_migrations, CURRENT_VERSION};

use crate::model::now;
use crate::{
    DeadLetterEntry, EventMetadata, EventStatus, NewOutboxEvent, OutboxEvent, OutboxStore,
    StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const EVENT_COLUMNS: &str = "id, event_type, aggregate_type, aggregate_id, payload, \
     correlation_id, metadata_timestamp, metadata_version, status, retry_count, \
     next_retry_at, last_error, created_at, published_at";

fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => StoreError::Database(e),
        tokio_rusqlite::Error::ConnectionClosed | tokio_rusqlite::Error::Close(_) => {
            StoreError::Connection("Connection closed".to_string())
        }
        other => StoreError::Connection(other.to_string()),
    }
}

fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| parse_ts(idx, &raw)).transpose()
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    let payload: String = row.get(4)?;
    let payload = serde_json::from_str(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    let status: String = row.get(8)?;
    let status = EventStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            Type::Text,
            format!("unknown event status {:?}", status).into(),
        )
    })?;

    Ok(OutboxEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        aggregate_type: row.get(2)?,
        aggregate_id: row.get(3)?,
        payload,
        metadata: EventMetadata {
            correlation_id: row.get(5)?,
            timestamp: get_ts(row, 6)?,
            version: row.get(7)?,
        },
        status,
        retry_count: row.get(9)?,
        next_retry_at: get_opt_ts(row, 10)?,
        last_error: row.get(11)?,
        created_at: get_ts(row, 12)?,
        published_at: get_opt_ts(row, 13)?,
    })
}

fn dead_letter_from_row(row: &Row<'_>) -> rusqlite::Result<DeadLetterEntry> {
    let event: String = row.get(0)?;
    let event = serde_json::from_str(&event)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    Ok(DeadLetterEntry {
        event,
        reason: row.get(1)?,
        dead_lettered_at: get_ts(row, 2)?,
    })
}

fn insert_event(conn: &Connection, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
    event.validate()?;
    let event = OutboxEvent::from_new(event);

    conn.execute(
        "INSERT INTO outbox_events (id, event_type, aggregate_type, aggregate_id, payload,
            correlation_id, metadata_timestamp, metadata_version, status, retry_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event.id,
            event.event_type,
            event.aggregate_type,
            event.aggregate_id,
            serde_json::to_string(&event.payload)?,
            event.metadata.correlation_id,
            format_ts(event.metadata.timestamp),
            event.metadata.version,
            event.status.as_str(),
            event.retry_count,
            format_ts(event.created_at),
        ],
    )?;

    Ok(event)
}

/// Insert an event inside a caller-owned transaction.
///
/// The event becomes visible to pollers only when the caller commits, which
/// ties it to the business write sharing the transaction. The schema must
/// already exist (see [`run_migrations`]).
pub fn insert_event_tx(tx: &Transaction<'_>, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
    insert_event(tx, event)
}

fn find_event(conn: &Connection, id: &str) -> StoreResult<Option<OutboxEvent>> {
    let sql = format!("SELECT {} FROM outbox_events WHERE id = ?1", EVENT_COLUMNS);
    Ok(conn.query_row(&sql, [id], event_from_row).optional()?)
}

fn find_dead_letter(conn: &Connection, id: &str) -> StoreResult<Option<DeadLetterEntry>> {
    Ok(conn
        .query_row(
            "SELECT event, reason, dead_lettered_at FROM outbox_dead_letters WHERE event_id = ?1",
            [id],
            dead_letter_from_row,
        )
        .optional()?)
}

/// Explain why an update matched no row.
fn state_error(conn: &Connection, id: &str) -> StoreError {
    let row: rusqlite::Result<Option<(String, Option<String>)>> = conn
        .query_row(
            "SELECT status, locked_by FROM outbox_events WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional();
    match row {
        Ok(Some((status, Some(_)))) if status == EventStatus::Pending.as_str() => {
            StoreError::ClaimLost(id.to_string())
        }
        Ok(Some((status, _))) => StoreError::invalid_state(id, status),
        Ok(None) => match find_dead_letter(conn, id) {
            Ok(Some(_)) => StoreError::invalid_state(id, EventStatus::DeadLettered),
            Ok(None) => StoreError::NotFound(id.to_string()),
            Err(e) => e,
        },
        Err(e) => StoreError::Database(e),
    }
}

/// Whether a pending event is leased to someone other than `owner_id`.
fn claimed_by_other(conn: &Connection, id: &str, owner_id: &str) -> StoreResult<bool> {
    let other: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM outbox_events
             WHERE id = ?1 AND status = 'pending'
               AND locked_by IS NOT NULL AND locked_by != ?2",
            params![id, owner_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(other.is_some())
}

/// Durable outbox store backed by a SQLite file.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    conn: tokio_rusqlite::Connection,
    path: String,
    owner_id: String,
    lock_timeout: Duration,
}

impl SqliteOutboxStore {
    /// Open (or create) the store at `path` and apply pending migrations.
    ///
    /// `lock_timeout` bounds how long a fetched event stays claimed by this
    /// store before other pollers may pick it up again.
    pub async fn open(path: &Path, lock_timeout: Duration) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening outbox database");

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        Self::init(conn, path_str, lock_timeout).await
    }

    /// Open a private in-memory database. Useful for tests.
    pub async fn open_in_memory(lock_timeout: Duration) -> StoreResult<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Self::init(conn, ":memory:".to_string(), lock_timeout).await
    }

    async fn init(
        conn: tokio_rusqlite::Connection,
        path: String,
        lock_timeout: Duration,
    ) -> StoreResult<Self> {
        let store = Self {
            conn,
            path,
            owner_id: format!("poller-{}", uuid::Uuid::new_v4()),
            lock_timeout,
        };
        store.call(|conn| run_migrations(conn)).await?;
        info!(path = %store.path, owner_id = %store.owner_id, "Outbox database ready");
        Ok(store)
    }

    /// Replace the generated lease owner id.
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Run a closure on the executor thread.
    ///
    /// Only SQL and lightweight row mapping belong inside the closure.
    async fn call<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        match self.conn.call(move |conn| Ok(f(conn))).await {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Check the connection with a trivial query.
    pub async fn health_check(&self) -> StoreResult<()> {
        self.call(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(())
        })
        .await?;
        debug!("Outbox database health check passed");
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn add_event(&self, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
        let event = self.call(move |conn| insert_event(conn, event)).await?;
        debug!(event_id = %event.id, event_type = %event.event_type, "Event added to outbox");
        Ok(event)
    }

    async fn fetch_pending_events(&self, limit: usize) -> StoreResult<Vec<OutboxEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let owner_id = self.owner_id.clone();
        let lease = chrono::Duration::from_std(self.lock_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let events = self
            .call(move |conn| {
                let at = now();
                let at_str = format_ts(at);
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let events = {
                    let sql = format!(
                        "SELECT {} FROM outbox_events
                         WHERE status = 'pending'
                           AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                           AND (locked_until IS NULL OR locked_until <= ?1)
                         ORDER BY created_at, rowid
                         LIMIT ?2",
                        EVENT_COLUMNS
                    );
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt.query_map(params![at_str, limit], event_from_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };

                let locked_until = format_ts(at + lease);
                for event in &events {
                    tx.execute(
                        "UPDATE outbox_events SET locked_by = ?1, locked_until = ?2 WHERE id = ?3",
                        params![owner_id, locked_until, event.id],
                    )?;
                }

                tx.commit()?;
                Ok(events)
            })
            .await?;

        if !events.is_empty() {
            debug!(count = events.len(), owner_id = %self.owner_id, "Claimed pending events");
        }
        Ok(events)
    }

    async fn renew_claim(&self, id: &str, lease: Duration) -> StoreResult<bool> {
        let id = id.to_string();
        let owner_id = self.owner_id.clone();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let renewed = self
            .call({
                let id = id.clone();
                move |conn| {
                // Only a competing fetch rewrites locked_by, so an expired lease
                // still carrying our id has not been taken over.
                let changed = conn.execute(
                    "UPDATE outbox_events SET locked_until = ?3
                     WHERE id = ?1 AND status = 'pending' AND locked_by = ?2",
                    params![id, owner_id, format_ts(now() + lease)],
                )?;
                Ok(changed == 1)
            }})
            .await?;

        if !renewed {
            debug!(event_id = %id, owner_id = %self.owner_id, "Claim on event lost");
        }
        Ok(renewed)
    }

    async fn mark_as_published(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        let owner_id = self.owner_id.clone();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE outbox_events
                 SET status = 'published',
                     published_at = COALESCE(published_at, ?2),
                     next_retry_at = NULL,
                     locked_by = NULL,
                     locked_until = NULL
                 WHERE id = ?1
                   AND (status = 'published'
                        OR (status = 'pending' AND (locked_by IS NULL OR locked_by = ?3)))",
                params![id, format_ts(now()), owner_id],
            )?;
            if changed == 0 {
                return Err(state_error(conn, &id));
            }
            Ok(())
        })
        .await
    }

    async fn schedule_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let last_error = last_error.to_string();
        let owner_id = self.owner_id.clone();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE outbox_events
                 SET retry_count = ?2,
                     next_retry_at = ?3,
                     last_error = ?4,
                     locked_by = NULL,
                     locked_until = NULL
                 WHERE id = ?1 AND status = 'pending'
                   AND (locked_by IS NULL OR locked_by = ?5)",
                params![id, retry_count, format_ts(next_retry_at), last_error, owner_id],
            )?;
            if changed == 0 {
                return Err(state_error(conn, &id));
            }
            Ok(())
        })
        .await
    }

    async fn move_to_dead_letter(&self, id: &str, reason: &str) -> StoreResult<()> {
        let event_id = id.to_string();
        let dead_reason = reason.to_string();
        let owner_id = self.owner_id.clone();
        let moved = self
            .call(move |conn| {
                let (id, reason) = (event_id, dead_reason);
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                if find_dead_letter(&tx, &id)?.is_some() {
                    return Ok(false);
                }
                let event = match find_event(&tx, &id)? {
                    Some(event) => event,
                    None => return Err(StoreError::NotFound(id)),
                };
                if event.status == EventStatus::Published {
                    return Err(StoreError::invalid_state(&id, event.status));
                }
                if claimed_by_other(&tx, &id, &owner_id)? {
                    return Err(StoreError::ClaimLost(id));
                }

                let entry = DeadLetterEntry::new(event, &reason);
                tx.execute(
                    "INSERT INTO outbox_dead_letters (event_id, event, reason, dead_lettered_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        id,
                        serde_json::to_string(&entry.event)?,
                        entry.reason,
                        format_ts(entry.dead_lettered_at),
                    ],
                )?;
                tx.execute("DELETE FROM outbox_events WHERE id = ?1", [&id])?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if moved {
            warn!(event_id = %id, reason, "Event moved to dead letter");
        }
        Ok(())
    }

    async fn get_event_by_id(&self, id: &str) -> StoreResult<Option<OutboxEvent>> {
        let id = id.to_string();
        self.call(move |conn| match find_event(conn, &id)? {
            Some(event) => Ok(Some(event)),
            None => Ok(find_dead_letter(conn, &id)?.map(|entry| entry.event)),
        })
        .await
    }

    async fn get_dead_letter(&self, id: &str) -> StoreResult<Option<DeadLetterEntry>> {
        let id = id.to_string();
        self.call(move |conn| find_dead_letter(conn, &id)).await
    }

    async fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<DeadLetterEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT event, reason, dead_lettered_at FROM outbox_dead_letters
                 ORDER BY dead_lettered_at, rowid
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], dead_letter_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn pending_count(&self) -> StoreResult<usize> {
        self.call(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox_events WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }
}
