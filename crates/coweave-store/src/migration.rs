//! Database schema migrations for SQLite.
//!
//! Versioned migrations: each version is a batch of SQL applied once, in
//! order, inside a single transaction, and recorded in `schema_migrations`.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per CoValue: its header, CBOR-encoded
        CREATE TABLE covalues (
            co_id BLOB PRIMARY KEY,           -- 20 bytes, truncated Blake3 of the header
            header BLOB NOT NULL,
            created_at INTEGER NOT NULL       -- local timestamp of first write
        );

        -- Transactions, append-only per session
        CREATE TABLE transactions (
            co_id BLOB NOT NULL,
            session_id TEXT NOT NULL,
            tx_index INTEGER NOT NULL,
            tx BLOB NOT NULL,                 -- CBOR-encoded transaction
            PRIMARY KEY (co_id, session_id, tx_index)
        );

        -- Signatures over the chain hash after the indexed transaction
        CREATE TABLE signatures (
            co_id BLOB NOT NULL,
            session_id TEXT NOT NULL,
            tx_index INTEGER NOT NULL,
            signature BLOB NOT NULL,          -- 64 bytes, Ed25519
            PRIMARY KEY (co_id, session_id, tx_index)
        );
        "#,
    )?;

    Ok(())
}

/// Migration v2: per-session counts, so metadata loads skip the transactions.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE sessions (
            co_id BLOB NOT NULL,
            session_id TEXT NOT NULL,
            tx_count INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (co_id, session_id)
        );

        INSERT INTO sessions (co_id, session_id, tx_count, updated_at)
            SELECT co_id, session_id, COUNT(*), 0 FROM transactions GROUP BY co_id, session_id;
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
