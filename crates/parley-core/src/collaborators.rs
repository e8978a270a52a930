//! Collaborators the realtime core consumes but does not own.
//!
//! Token issuance, conversation membership, push providers and device
//! bookkeeping live in other services. The core talks to them only through
//! these traits; concrete implementations are wired in by the binary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::frames::ServerEvent;
use crate::ids::{ConversationId, DeviceId, UserId};

/// Verified token claims.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (the user ID). A token without one is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiry (seconds since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Issued-at (seconds since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Any other claims, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Why a token failed verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Signature was fine but the token is past its expiry.
    #[error("token expired")]
    Expired,
    /// Malformed token, bad signature, wrong issuer, etc.
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Checks token signature and expiry.
pub trait TokenVerifier: Send + Sync {
    /// Verify a raw token and return its claims.
    fn verify(&self, token: &str) -> Result<Claims, VerifyError>;
}

/// Conversation membership lookup failed.
#[derive(Debug, Error)]
#[error("conversation directory unavailable: {0}")]
pub struct DirectoryError(pub String);

/// Resolves the current participants of a conversation.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    /// Current members. Private conversations yield their two members, groups
    /// their full member list. `None` if the conversation does not exist.
    async fn participants(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Vec<UserId>>, DirectoryError>;
}

/// Body of an offline push notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    /// Short title.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Structured data for the client app.
    pub data: Value,
}

/// Push delivery failed.
#[derive(Debug, Error)]
#[error("push delivery failed: {0}")]
pub struct PushError(pub String);

/// Sends a push notification to a user's registered devices.
#[async_trait]
pub trait PushSender: Send + Sync {
    /// Best-effort send. Callers log failures and move on.
    async fn send(&self, user_id: &UserId, notification: PushNotification) -> Result<(), PushError>;
}

/// Device online/offline bookkeeping failed.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// The device has not been registered yet (first connect before the
    /// client called the registration API). Expected; callers ignore it.
    #[error("device not registered")]
    NotRegistered,
    /// Backing store failure.
    #[error("device recorder unavailable: {0}")]
    Unavailable(String),
}

/// Records device connectivity for other services (last seen, push routing).
#[async_trait]
pub trait DeviceRecorder: Send + Sync {
    /// Mark a device online.
    async fn device_online(&self, user_id: &UserId, device_id: &DeviceId) -> Result<(), RecorderError>;
    /// Mark a device offline.
    async fn device_offline(&self, user_id: &UserId, device_id: &DeviceId) -> Result<(), RecorderError>;
}

/// Pushes an event to every device of a user, wherever it is connected.
///
/// Implemented by the message router. Returns the number of local sockets
/// written; remote delivery is best-effort and not counted.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver `event` to all of `user_id`'s devices.
    async fn send_to_user(&self, user_id: &UserId, event: &ServerEvent) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_keep_unknown_fields() {
        let claims: Claims =
            serde_json::from_str(r#"{"sub":"u1","exp":10,"role":"admin"}"#).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("u1"));
        assert_eq!(claims.exp, Some(10));
        assert_eq!(claims.extra["role"], "admin");
    }

    #[test]
    fn claims_without_subject() {
        let claims: Claims = serde_json::from_str(r#"{"exp":10}"#).unwrap();
        assert!(claims.sub.is_none());
    }

    #[test]
    fn verify_error_display() {
        assert_eq!(VerifyError::Expired.to_string(), "token expired");
        assert!(VerifyError::Invalid("bad sig".into()).to_string().contains("bad sig"));
    }

    #[test]
    fn recorder_error_display() {
        assert_eq!(RecorderError::NotRegistered.to_string(), "device not registered");
    }
}
