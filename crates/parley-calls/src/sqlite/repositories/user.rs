//! `users` and `contacts` tables.

use parley_core::UserId;
use rusqlite::{Connection, params};

use crate::errors::StoreResult;

/// User and contact repository.
pub struct UserRepo;

impl UserRepo {
    /// Insert a user if absent. Returns whether a row was created.
    pub fn create(conn: &Connection, id: &UserId, display_name: &str, now: i64) -> StoreResult<bool> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)",
            params![id.as_str(), display_name, now],
        )?;
        Ok(changed > 0)
    }

    /// Whether the user exists.
    pub fn exists(conn: &Connection, id: &UserId) -> StoreResult<bool> {
        let found = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM users WHERE id = ?1)",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    /// Record a mutual contact relationship.
    pub fn add_contact(conn: &Connection, a: &UserId, b: &UserId, now: i64) -> StoreResult<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO contacts (user_id, contact_id, created_at) VALUES (?1, ?2, ?3)",
        )?;
        let _ = stmt.execute(params![a.as_str(), b.as_str(), now])?;
        let _ = stmt.execute(params![b.as_str(), a.as_str(), now])?;
        Ok(())
    }

    /// Whether `contact` is in `user`'s contact list.
    pub fn is_contact(conn: &Connection, user: &UserId, contact: &UserId) -> StoreResult<bool> {
        let found = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM contacts WHERE user_id = ?1 AND contact_id = ?2)",
            params![user.as_str(), contact.as_str()],
            |row| row.get(0),
        )?;
        Ok(found)
    }
}
