//! Call record and signaling payload.

use parley_core::{CallId, ConversationId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::{CallStatus, EndReason, Role};

/// A persisted call. Never deleted; terminal rows form the call history.
///
/// Timestamps are unix epoch milliseconds. `duration` is whole seconds of
/// connected time and is only set for calls that were connected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    /// Call ID.
    pub id: CallId,
    /// The caller/callee 1:1 conversation.
    pub conversation_id: ConversationId,
    /// Who dialed.
    pub caller_id: UserId,
    /// Who was dialed.
    pub callee_id: UserId,
    /// Current status.
    pub status: CallStatus,
    /// When the call was initiated.
    pub created_at: i64,
    /// When the callee accepted.
    pub started_at: Option<i64>,
    /// When the call reached a terminal status.
    pub ended_at: Option<i64>,
    /// Connected seconds.
    pub duration: Option<i64>,
    /// Why the call ended.
    pub end_reason: Option<EndReason>,
}

impl Call {
    /// The role `user` plays in this call, or `None` for outsiders.
    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        if *user == self.caller_id {
            Some(Role::Caller)
        } else if *user == self.callee_id {
            Some(Role::Callee)
        } else {
            None
        }
    }

    /// The participant opposite `role`.
    pub fn counterpart(&self, role: Role) -> &UserId {
        match role {
            Role::Caller => &self.callee_id,
            Role::Callee => &self.caller_id,
        }
    }

    /// Whether the call still holds its participants.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// A WebRTC signaling message relayed between participants.
///
/// The payload is opaque to the server and never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    /// Call the signal belongs to.
    pub call_id: CallId,
    /// Sender.
    pub from_user_id: UserId,
    /// `offer`, `answer`, `ice-candidate`, ...
    #[serde(rename = "type")]
    pub signal_type: String,
    /// Opaque SDP or candidate data.
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Call {
        Call {
            id: CallId::from("call-1"),
            conversation_id: ConversationId::from("conv-1"),
            caller_id: UserId::from("alice"),
            callee_id: UserId::from("bob"),
            status: CallStatus::Connected,
            created_at: 1_000,
            started_at: Some(2_000),
            ended_at: None,
            duration: None,
            end_reason: None,
        }
    }

    #[test]
    fn roles() {
        let call = sample();
        assert_eq!(call.role_of(&UserId::from("alice")), Some(Role::Caller));
        assert_eq!(call.role_of(&UserId::from("bob")), Some(Role::Callee));
        assert_eq!(call.role_of(&UserId::from("eve")), None);
        assert_eq!(call.counterpart(Role::Caller).as_str(), "bob");
        assert_eq!(call.counterpart(Role::Callee).as_str(), "alice");
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["callerId"], "alice");
        assert_eq!(value["conversationId"], "conv-1");
        assert_eq!(value["status"], "connected");
        assert_eq!(value["startedAt"], 2_000);
        assert!(value["endReason"].is_null());
    }

    #[test]
    fn signal_payload_uses_type_key() {
        let payload = SignalPayload {
            call_id: CallId::from("call-1"),
            from_user_id: UserId::from("alice"),
            signal_type: "offer".into(),
            data: json!({"sdp": "v=0"}),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["fromUserId"], "alice");
        assert_eq!(value["data"]["sdp"], "v=0");
    }
}
