//! Outbox schema migrations.
//!
//! Migrations run in order and are tracked in the `migrations` table.

use crate::StoreResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Outbox schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running outbox migrations");

    if current_version < 1 {
        migrate_v1_outbox_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_dead_letters(conn)?;
    }

    info!("Outbox migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: pending set with retry bookkeeping and lease columns.
fn migrate_v1_outbox_events(conn: &Connection) -> StoreResult<()> {
    info!("Applying migration v1: outbox events");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            correlation_id TEXT NOT NULL,
            metadata_timestamp TEXT NOT NULL,
            metadata_version INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            published_at TEXT,
            locked_by TEXT,
            locked_until TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_events_due
            ON outbox_events(status, next_retry_at, created_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_events_aggregate
            ON outbox_events(aggregate_type, aggregate_id);
        ",
    )?;

    record_migration(conn, 1, "outbox_events")
}

/// V2: dead-letter partition.
fn migrate_v2_dead_letters(conn: &Connection) -> StoreResult<()> {
    info!("Applying migration v2: dead letters");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_dead_letters (
            event_id TEXT PRIMARY KEY,
            event TEXT NOT NULL,
            reason TEXT NOT NULL,
            dead_lettered_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_dead_letters_time
            ON outbox_dead_letters(dead_lettered_at);
        ",
    )?;

    record_migration(conn, 2, "dead_letters")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let versions: Vec<i32> = conn
            .prepare("SELECT version FROM migrations ORDER BY version")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn test_tables_exist() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["outbox_events", "outbox_dead_letters"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }
}
