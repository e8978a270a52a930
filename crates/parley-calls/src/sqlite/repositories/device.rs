//! `devices` table.

use parley_core::{DeviceId, UserId};
use rusqlite::{Connection, params};

use crate::errors::StoreResult;

/// Device repository.
pub struct DeviceRepo;

impl DeviceRepo {
    /// Register (or re-own) a device for a user. Starts offline.
    pub fn register(conn: &Connection, user: &UserId, device: &DeviceId) -> StoreResult<()> {
        let _ = conn.execute(
            "INSERT INTO devices (id, user_id, online) VALUES (?1, ?2, 0)
             ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id",
            params![device.as_str(), user.as_str()],
        )?;
        Ok(())
    }

    /// Flip the online flag. Returns `false` when the `(user, device)` pair
    /// is not registered.
    pub fn set_online(
        conn: &Connection,
        user: &UserId,
        device: &DeviceId,
        online: bool,
        now: i64,
    ) -> StoreResult<bool> {
        let changed = conn.execute(
            "UPDATE devices SET online = ?1, last_seen_at = ?2 WHERE id = ?3 AND user_id = ?4",
            params![online, now, device.as_str(), user.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Whether the device is flagged online.
    pub fn is_online(conn: &Connection, device: &DeviceId) -> StoreResult<bool> {
        let online = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM devices WHERE id = ?1 AND online = 1)",
            params![device.as_str()],
            |row| row.get(0),
        )?;
        Ok(online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::migrations::run_migrations;
    use crate::sqlite::repositories::UserRepo;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        let _ = run_migrations(&conn).unwrap();
        let _ = UserRepo::create(&conn, &UserId::from("alice"), "Alice", 0).unwrap();
        conn
    }

    #[test]
    fn online_toggle() {
        let conn = setup();
        let alice = UserId::from("alice");
        let phone = DeviceId::from("phone");
        DeviceRepo::register(&conn, &alice, &phone).unwrap();
        assert!(!DeviceRepo::is_online(&conn, &phone).unwrap());

        assert!(DeviceRepo::set_online(&conn, &alice, &phone, true, 10).unwrap());
        assert!(DeviceRepo::is_online(&conn, &phone).unwrap());
        assert!(DeviceRepo::set_online(&conn, &alice, &phone, false, 20).unwrap());
        assert!(!DeviceRepo::is_online(&conn, &phone).unwrap());
    }

    #[test]
    fn unregistered_device_not_updated() {
        let conn = setup();
        let updated =
            DeviceRepo::set_online(&conn, &UserId::from("alice"), &DeviceId::from("tablet"), true, 0)
                .unwrap();
        assert!(!updated);
    }
}
