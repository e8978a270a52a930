//! Schema migration runner.
//!
//! Migrations are embedded with [`include_str!`] and applied in version
//! order, each inside its own transaction. The `schema_version` table
//! records what has run, so calling [`run_migrations`] twice is a no-op.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Users, contacts, conversations, devices, calls",
    sql: include_str!("v001_schema.sql"),
}];

/// Apply every pending migration. Returns how many ran.
///
/// # Errors
///
/// Returns [`StoreError::Migration`] if any migration SQL fails.
pub fn run_migrations(conn: &Connection) -> StoreResult<u32> {
    ensure_version_table(conn)?;
    let current = current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version <= current {
            debug!(version = migration.version, "migration already applied");
            continue;
        }
        info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        apply(conn, migration)?;
        applied += 1;
    }

    if applied > 0 {
        info!(applied, "migrations complete");
    }
    Ok(applied)
}

/// Highest applied migration version, or 0.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        message: format!("failed to read schema_version: {e}"),
    })
}

/// Latest migration version known to this build.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

fn ensure_version_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
           version     INTEGER PRIMARY KEY,
           applied_at  TEXT    NOT NULL,
           description TEXT
         );",
    )
    .map_err(|e| StoreError::Migration {
        message: format!("failed to create schema_version table: {e}"),
    })
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    let fail = |stage: &str, e: rusqlite::Error| StoreError::Migration {
        message: format!("v{} {stage}: {e}", migration.version),
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| fail("begin", e))?;
    tx.execute_batch(migration.sql)
        .map_err(|e| fail("apply", e))?;
    let _ = tx
        .execute(
            "INSERT INTO schema_version (version, applied_at, description) \
             VALUES (?1, datetime('now'), ?2)",
            rusqlite::params![migration.version, migration.description],
        )
        .map_err(|e| fail("record", e))?;
    tx.commit().map_err(|e| fail("commit", e))
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;

    fn open_memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    fn names(conn: &Connection, kind: &str) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type = ?1")
            .unwrap()
            .query_map([kind], |row| row.get(0))
            .unwrap()
            .filter_map(Result::ok)
            .collect()
    }

    #[test]
    fn creates_all_tables() {
        let conn = open_memory();
        assert_eq!(run_migrations(&conn).unwrap(), 1);

        let tables = names(&conn, "table");
        for table in [
            "users",
            "contacts",
            "conversations",
            "conversation_members",
            "devices",
            "calls",
            "schema_version",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing table: {table}");
        }
    }

    #[test]
    fn idempotent() {
        let conn = open_memory();
        run_migrations(&conn).unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 0);
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn call_status_indexes_exist() {
        let conn = open_memory();
        run_migrations(&conn).unwrap();
        let indexes = names(&conn, "index");
        assert!(indexes.iter().any(|i| i == "idx_calls_caller_status"));
        assert!(indexes.iter().any(|i| i == "idx_calls_callee_status"));
    }

    #[test]
    fn unknown_status_rejected_by_check() {
        let conn = open_memory();
        run_migrations(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO users (id, display_name, created_at) VALUES ('a', 'A', 0), ('b', 'B', 0);
             INSERT INTO conversations (id, kind, created_at) VALUES ('c', 'private', 0);",
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO calls (id, conversation_id, caller_id, callee_id, status, created_at)
             VALUES ('x', 'c', 'a', 'b', 'dialing', 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn self_contact_rejected() {
        let conn = open_memory();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (id, display_name, created_at) VALUES ('a', 'A', 0)",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO contacts (user_id, contact_id, created_at) VALUES ('a', 'a', 0)",
            [],
        );
        assert!(result.is_err());
    }
}
