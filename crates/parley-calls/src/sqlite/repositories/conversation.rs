//! `conversations` and `conversation_members` tables.

use parley_core::{ConversationId, UserId};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::StoreResult;

/// Conversation repository.
pub struct ConversationRepo;

impl ConversationRepo {
    /// Find or create the 1:1 conversation between `a` and `b`.
    ///
    /// The pair is keyed by its sorted IDs, so `(a, b)` and `(b, a)` resolve
    /// to the same row. Run inside a write transaction to make the
    /// lookup-then-insert atomic.
    pub fn get_or_create_private(
        conn: &Connection,
        a: &UserId,
        b: &UserId,
        now: i64,
    ) -> StoreResult<ConversationId> {
        let key = private_key(a, b);
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM conversations WHERE private_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(ConversationId::from(id));
        }

        let id = ConversationId::new();
        let _ = conn.execute(
            "INSERT INTO conversations (id, kind, private_key, created_at) VALUES (?1, 'private', ?2, ?3)",
            params![id.as_str(), key, now],
        )?;
        Self::add_members(conn, &id, &[a.clone(), b.clone()], now)?;
        Ok(id)
    }

    /// Create a group conversation with the given members.
    pub fn create_group(conn: &Connection, members: &[UserId], now: i64) -> StoreResult<ConversationId> {
        let id = ConversationId::new();
        let _ = conn.execute(
            "INSERT INTO conversations (id, kind, created_at) VALUES (?1, 'group', ?2)",
            params![id.as_str(), now],
        )?;
        Self::add_members(conn, &id, members, now)?;
        Ok(id)
    }

    /// Add members, ignoring ones already present.
    pub fn add_members(
        conn: &Connection,
        id: &ConversationId,
        members: &[UserId],
        now: i64,
    ) -> StoreResult<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
        )?;
        for member in members {
            let _ = stmt.execute(params![id.as_str(), member.as_str(), now])?;
        }
        Ok(())
    }

    /// Remove a member. Returns whether they were a member.
    pub fn remove_member(conn: &Connection, id: &ConversationId, user: &UserId) -> StoreResult<bool> {
        let changed = conn.execute(
            "DELETE FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
            params![id.as_str(), user.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Current members, or `None` for an unknown conversation.
    pub fn members(conn: &Connection, id: &ConversationId) -> StoreResult<Option<Vec<UserId>>> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM conversations WHERE id = ?1)",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(None);
        }
        let mut stmt = conn.prepare_cached(
            "SELECT user_id FROM conversation_members WHERE conversation_id = ?1 ORDER BY joined_at, user_id",
        )?;
        let members = stmt
            .query_map(params![id.as_str()], |row| row.get::<_, String>(0).map(UserId::from))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(members))
    }
}

fn private_key(a: &UserId, b: &UserId) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}
