//! Branded ID newtypes.
//!
//! Users and devices are identified by strings minted elsewhere (the token
//! issuer and the client app), so their IDs wrap arbitrary strings. IDs this
//! core mints itself (calls, conversations, connections) are UUID v7.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

macro_rules! generated_id {
    ($name:ident) => {
        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

branded_id! {
    /// Account identifier, taken from the token's `sub` claim.
    UserId
}

branded_id! {
    /// One app installation. A user may have several live at once.
    DeviceId
}

branded_id! {
    /// A private (1:1) or group conversation.
    ConversationId
}

branded_id! {
    /// A persisted call record.
    CallId
}

branded_id! {
    /// A single socket registration. Distinguishes a device's old socket from
    /// the one that replaced it.
    ConnectionId
}

generated_id!(ConversationId);
generated_id!(CallId);
generated_id!(ConnectionId);

impl DeviceId {
    /// Fallback device ID for clients that did not send one: tied to the
    /// user and the connect time.
    #[must_use]
    pub fn fallback_for(user_id: &UserId, millis: i64) -> Self {
        Self(format!("{user_id}-{millis}"))
    }
}
