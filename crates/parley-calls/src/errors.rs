//! Error types for the call store and service.

use parley_core::{CallId, UserId};
use thiserror::Error;

use crate::status::{CallAction, CallStatus};

/// Storage-layer failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Which migration failed and why.
        message: String,
    },

    /// A row holds a value the code does not recognize.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Blocking task panicked or was cancelled.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Store result alias.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced to callers of [`CallService`](crate::CallService).
///
/// None of these are retried automatically.
#[derive(Debug, Error)]
pub enum CallError {
    /// Unknown call ID.
    #[error("call not found: {0}")]
    CallNotFound(CallId),

    /// Unknown callee.
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// Actor may not perform this operation (not a participant, wrong role,
    /// calling themselves, or not a contact of the callee).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Caller or callee already has a call in progress.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The call's current status does not allow the action.
    #[error("cannot {action} a call that is {from}")]
    InvalidTransition {
        /// Status at the time of the attempt.
        from: CallStatus,
        /// Rejected action.
        action: CallAction,
    },

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for CallError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

impl CallError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CallNotFound(_) | Self::UserNotFound(_) => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidTransition { .. } => "INVALID_STATE",
            Self::Store(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(CallError::CallNotFound(CallId::from("c")).code(), "NOT_FOUND");
        assert_eq!(CallError::UserNotFound(UserId::from("u")).code(), "NOT_FOUND");
        assert_eq!(CallError::Forbidden("x".into()).code(), "FORBIDDEN");
        assert_eq!(CallError::Conflict("x".into()).code(), "CONFLICT");
        assert_eq!(
            CallError::InvalidTransition {
                from: CallStatus::Ended,
                action: CallAction::Hangup
            }
            .code(),
            "INVALID_STATE"
        );
    }

    #[test]
    fn invalid_transition_display() {
        let err = CallError::InvalidTransition {
            from: CallStatus::Missed,
            action: CallAction::Hangup,
        };
        assert_eq!(err.to_string(), "cannot hangup a call that is missed");
    }

    #[test]
    fn sqlite_error_converts_to_store() {
        let err: CallError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, CallError::Store(StoreError::Sqlite(_))));
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}
