//! # parley-core
//!
//! Foundation types shared by every Parley crate:
//!
//! - Branded ID newtypes ([`ids`]) so a device ID is never passed where a user ID is expected
//! - Wire frames exchanged with clients ([`frames`]) and WebSocket close codes ([`close_code`])
//! - Traits for the collaborators this core consumes but does not own ([`collaborators`])
//! - `tracing` subscriber setup ([`logging`]) and metric names ([`metric`])

#![deny(unsafe_code)]

pub mod close_code;
pub mod collaborators;
pub mod frames;
pub mod ids;
pub mod logging;
pub mod metric;

pub use collaborators::{
    Claims, ConversationDirectory, DeviceRecorder, DirectoryError, EventSink, PushNotification,
    PushError, PushSender, RecorderError, TokenVerifier, VerifyError,
};
pub use frames::{ClientFrame, ClientFrameKind, ServerEvent};
pub use ids::{CallId, ConnectionId, ConversationId, DeviceId, UserId};

/// Milliseconds since the Unix epoch, as used in every `timestamp` field on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
