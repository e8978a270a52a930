//! `calls` table.

use parley_core::{CallId, ConversationId, UserId};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::StoreResult;
use crate::status::EndReason;
use crate::types::Call;

const COLUMNS: &str = "id, conversation_id, caller_id, callee_id, status, created_at, \
                       started_at, ended_at, duration, end_reason";

/// Call repository.
pub struct CallRepo;

impl CallRepo {
    /// Insert a new call row.
    pub fn insert(conn: &Connection, call: &Call) -> StoreResult<()> {
        let _ = conn.execute(
            &format!("INSERT INTO calls ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                call.id.as_str(),
                call.conversation_id.as_str(),
                call.caller_id.as_str(),
                call.callee_id.as_str(),
                call.status.as_str(),
                call.created_at,
                call.started_at,
                call.ended_at,
                call.duration,
                call.end_reason.map(EndReason::as_str),
            ],
        )?;
        Ok(())
    }

    /// Fetch a call by ID.
    pub fn get(conn: &Connection, id: &CallId) -> StoreResult<Option<Call>> {
        let call = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM calls WHERE id = ?1"),
                params![id.as_str()],
                Self::map_row,
            )
            .optional()?;
        Ok(call)
    }

    /// Write back the mutable columns of `call`.
    pub fn update(conn: &Connection, call: &Call) -> StoreResult<()> {
        let _ = conn.execute(
            "UPDATE calls
             SET status = ?1, started_at = ?2, ended_at = ?3, duration = ?4, end_reason = ?5
             WHERE id = ?6",
            params![
                call.status.as_str(),
                call.started_at,
                call.ended_at,
                call.duration,
                call.end_reason.map(EndReason::as_str),
                call.id.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Whether any of `users` is caller or callee of a non-terminal call.
    pub fn any_active_for(conn: &Connection, users: &[&UserId]) -> StoreResult<bool> {
        let mut stmt = conn.prepare_cached(
            "SELECT EXISTS (
               SELECT 1 FROM calls
               WHERE status IN ('initiated', 'ringing', 'connected')
                 AND (caller_id = ?1 OR callee_id = ?1)
             )",
        )?;
        for user in users {
            let busy: bool = stmt.query_row(params![user.as_str()], |row| row.get(0))?;
            if busy {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The user's non-terminal call, if any.
    pub fn active_for(conn: &Connection, user: &UserId) -> StoreResult<Option<Call>> {
        let call = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM calls
                     WHERE status IN ('initiated', 'ringing', 'connected')
                       AND (caller_id = ?1 OR callee_id = ?1)
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![user.as_str()],
                Self::map_row,
            )
            .optional()?;
        Ok(call)
    }

    /// Most recent calls involving `user`, newest first.
    pub fn history(conn: &Connection, user: &UserId, limit: u32) -> StoreResult<Vec<Call>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM calls
             WHERE caller_id = ?1 OR callee_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![user.as_str(), limit], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// IDs of `initiated`/`ringing` calls created at or before `cutoff`.
    pub fn unanswered_before(conn: &Connection, cutoff: i64) -> StoreResult<Vec<CallId>> {
        let mut stmt = conn.prepare(
            "SELECT id FROM calls
             WHERE status IN ('initiated', 'ringing') AND created_at <= ?1
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0).map(CallId::from))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Call> {
        let status: String = row.get(4)?;
        let end_reason: Option<String> = row.get(9)?;
        Ok(Call {
            id: CallId::from(row.get::<_, String>(0)?),
            conversation_id: ConversationId::from(row.get::<_, String>(1)?),
            caller_id: UserId::from(row.get::<_, String>(2)?),
            callee_id: UserId::from(row.get::<_, String>(3)?),
            status: status.parse().map_err(|e| conversion(4, e))?,
            created_at: row.get(5)?,
            started_at: row.get(6)?,
            ended_at: row.get(7)?,
            duration: row.get(8)?,
            end_reason: end_reason
                .map(|r| r.parse::<EndReason>())
                .transpose()
                .map_err(|e| conversion(9, e))?,
        })
    }
}

fn conversion(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}
