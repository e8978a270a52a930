//! Wire format of a fanout message.

use parley_core::{ConversationId, DeviceId, ServerEvent, UserId};
use serde::{Deserialize, Serialize};

use super::InstanceId;

/// Who a fanned-out event is for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    /// Every device of a user.
    User {
        /// Recipient.
        id: UserId,
    },
    /// One device.
    Device {
        /// Recipient device.
        id: DeviceId,
    },
    /// Every member of a conversation, resolved by the receiving instance.
    Conversation {
        /// Conversation.
        id: ConversationId,
        /// Members to skip (usually the sender).
        #[serde(rename = "excludeUserIds", default, skip_serializing_if = "Vec::is_empty")]
        exclude_user_ids: Vec<UserId>,
    },
    /// Every connection.
    Broadcast,
}

/// An event plus routing information and the publishing instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutEnvelope {
    /// The event to deliver.
    pub event: ServerEvent,
    /// Recipients.
    pub target: Target,
    /// Publisher, for self-delivery suppression.
    pub source_instance_id: InstanceId,
}

impl FanoutEnvelope {
    /// Decode from a broker payload.
    pub fn decode(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    /// Encode for publishing.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
