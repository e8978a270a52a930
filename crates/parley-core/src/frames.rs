//! JSON frames exchanged with clients over the WebSocket.
//!
//! Server → client frames are `{"type": ..., "payload": ...}`. The domain
//! event catalog (messages, friends, groups, presence) is owned by the
//! business services; this core only carries it. The call events are listed
//! here because the call service in this workspace emits them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ids::{DeviceId, UserId};
use crate::now_millis;

/// Event type names emitted by this core.
pub mod event_type {
    /// Acknowledgment sent once a socket is registered.
    pub const CONNECTED: &str = "connected";
    /// Reply to a client `ping` frame.
    pub const PONG: &str = "pong";
    /// Incoming call offer, sent to the callee.
    pub const CALL_INVITE: &str = "call:invite";
    /// Callee's device is ringing, sent to the caller.
    pub const CALL_RINGING: &str = "call:ringing";
    /// Callee picked up, sent to the caller.
    pub const CALL_ACCEPTED: &str = "call:accepted";
    /// Callee declined, sent to the caller.
    pub const CALL_REJECTED: &str = "call:rejected";
    /// A connected call was hung up, sent to the other party.
    pub const CALL_ENDED: &str = "call:ended";
    /// A call that never connected was abandoned, sent to the other party.
    pub const CALL_CANCELLED: &str = "call:cancelled";
    /// The callee missed the call (ring timeout).
    pub const CALL_MISSED: &str = "call:missed";
    /// Relayed WebRTC offer/answer/ICE payload.
    pub const CALL_SIGNAL: &str = "call:signal";
}

/// An event pushed to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Event type, e.g. `"call:invite"`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event body. Opaque to the transport.
    #[serde(default)]
    pub payload: Value,
}

impl ServerEvent {
    /// Build an event from a type name and payload.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// The `connected` acknowledgment sent after registration.
    pub fn connected(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self::new(
            event_type::CONNECTED,
            json!({
                "userId": user_id,
                "deviceId": device_id,
                "timestamp": now_millis(),
            }),
        )
    }

    /// The `pong` reply to an application-level ping.
    pub fn pong() -> Self {
        Self::new(event_type::PONG, json!({ "timestamp": now_millis() }))
    }

    /// Serialize to the JSON text sent on the socket.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A frame received from a client.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientFrame {
    /// Frame type.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Optional body.
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Control frames understood by the realtime core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrameKind {
    /// Application-level ping; answered with `pong`.
    Ping,
    /// Application-level heartbeat; refreshes liveness and shared presence.
    Heartbeat,
    /// Anything else. Handled by higher layers, if at all.
    Other(String),
}

impl ClientFrame {
    /// Decode a text frame. Returns `None` for anything that is not a JSON
    /// object with a string `type`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Classify the frame.
    pub fn kind(&self) -> ClientFrameKind {
        match self.frame_type.as_str() {
            "ping" => ClientFrameKind::Ping,
            "heartbeat" => ClientFrameKind::Heartbeat,
            other => ClientFrameKind::Other(other.to_owned()),
        }
    }
}
