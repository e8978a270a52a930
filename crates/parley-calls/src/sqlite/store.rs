//! Pool-backed store with explicit transaction scopes.
//!
//! [`CallStore::immediate`] is the only way to mutate. It opens a
//! `BEGIN IMMEDIATE` transaction, which takes `SQLite`'s write lock before
//! the first read, so a check-then-insert inside the closure cannot
//! interleave with another writer's.

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::errors::{StoreError, StoreResult};
use crate::sqlite::connection::ConnectionPool;
use crate::sqlite::migrations;

/// Transactional handle over the connection pool. Cheap to clone.
#[derive(Clone)]
pub struct CallStore {
    pool: ConnectionPool,
}

impl CallStore {
    /// Wrap an existing pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Run pending migrations on a pooled connection.
    pub fn migrate(&self) -> StoreResult<u32> {
        let conn = self.pool.get()?;
        migrations::run_migrations(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on `Ok`
    /// and rolling back on `Err`.
    pub fn immediate<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.pool.get().map_err(StoreError::from)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Run `f` against this store on the blocking pool.
    pub async fn blocking<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&CallStore) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| E::from(StoreError::Internal(format!("store task failed: {e}"))))?
    }

    /// Run a read-only closure on a pooled connection.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let conn = self.pool.get().map_err(StoreError::from)?;
        f(&conn)
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::sqlite::connection::{ConnectionConfig, new_in_memory};

    fn store() -> CallStore {
        let store = CallStore::new(new_in_memory(&ConnectionConfig::default()).unwrap());
        store.migrate().unwrap();
        store
    }

    fn count_users(store: &CallStore) -> i64 {
        store
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap()
    }

    #[test]
    fn commit_on_ok() {
        let store = store();
        store
            .immediate(|tx| {
                tx.execute(
                    "INSERT INTO users (id, display_name, created_at) VALUES ('a', 'A', 0)",
                    [],
                )
                .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(count_users(&store), 1);
    }

    #[test]
    fn rollback_on_err() {
        let store = store();
        let result: Result<(), StoreError> = store.immediate(|tx| {
            tx.execute(
                "INSERT INTO users (id, display_name, created_at) VALUES ('a', 'A', 0)",
                [],
            )?;
            Err(StoreError::Internal("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(count_users(&store), 0);
    }

    #[tokio::test]
    async fn blocking_runs_off_the_runtime() {
        let store = store();
        let n: i64 = store
            .blocking(|s| {
                s.read(|conn| {
                    conn.query_row("SELECT 41 + 1", [], |row| row.get(0))
                        .map_err(StoreError::from)
                })
            })
            .await
            .unwrap();
        assert_eq!(n, 42);
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = store();
        assert_eq!(store.migrate().unwrap(), 0);
    }
}
