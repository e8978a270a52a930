//! Cross-process fanout over a pub/sub broker.
//!
//! A user's devices, or a conversation's members, may be attached to
//! different processes. Each process publishes envelopes tagged with its
//! [`InstanceId`] and drops any envelope carrying its own id on receipt,
//! because the publisher already delivered locally.

pub mod adapter;
pub mod broker;
pub mod envelope;
pub mod memory;
pub mod redis;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use adapter::{FanoutAdapter, FanoutHandler, SubscriptionId};
pub use broker::{Broker, BrokerError, BrokerMessage, Topic};
pub use envelope::{FanoutEnvelope, Target};
pub use memory::{MemoryBroker, MemoryHub};
pub use self::redis::RedisBroker;

/// Process-unique tag on every published envelope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// `{pid}-{millis}-{random}`.
    pub fn generate() -> Self {
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}-{}",
            std::process::id(),
            parley_core::now_millis(),
            &random[..8]
        ))
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
