//! The broker seam: publish/subscribe plus TTL'd presence sets.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// A subscription target.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Exact channel name.
    Channel(String),
    /// Glob pattern (`*` matches any run of characters).
    Pattern(String),
}

/// A message received from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Channel it was published on.
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    /// Raw payload.
    pub payload: String,
}

impl BrokerMessage {
    /// The subscription this message was delivered for.
    pub fn topic(&self) -> Topic {
        match &self.pattern {
            Some(p) => Topic::Pattern(p.clone()),
            None => Topic::Channel(self.channel.clone()),
        }
    }
}

/// Broker failures. Callers above the adapter never see these.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Redis command or connection failure.
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    /// The broker has been shut down.
    #[error("broker closed")]
    Closed,
}

/// Pub/sub transport shared by every process.
///
/// Messages for active subscriptions arrive on the receiver handed out when
/// the broker was created, not through this trait.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError>;

    /// Start receiving messages for `topic`.
    async fn subscribe(&self, topic: &Topic) -> Result<(), BrokerError>;

    /// Stop receiving messages for `topic`.
    async fn unsubscribe(&self, topic: &Topic) -> Result<(), BrokerError>;

    /// Add `member` to the set at `key` and reset its TTL.
    async fn presence_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Reset the TTL of the set at `key`.
    async fn presence_refresh(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Remove `member` from the set at `key`.
    async fn presence_remove(&self, key: &str, member: &str) -> Result<(), BrokerError>;

    /// Members of the set at `key` (empty once expired).
    async fn presence_members(&self, key: &str) -> Result<Vec<String>, BrokerError>;

    /// Release connections. Later calls may fail with [`BrokerError::Closed`].
    async fn close(&self);
}

/// Redis-style glob match supporting `*` only.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // No `*` at all.
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_trailing_star() {
        assert!(glob_match("parley:conversation:*", "parley:conversation:abc"));
        assert!(glob_match("parley:conversation:*", "parley:conversation:"));
        assert!(!glob_match("parley:conversation:*", "parley:user:abc"));
    }

    #[test]
    fn glob_without_star_is_exact() {
        assert!(glob_match("a:b", "a:b"));
        assert!(!glob_match("a:b", "a:bc"));
    }

    #[test]
    fn glob_inner_stars() {
        assert!(glob_match("a*c*e", "abcde"));
        assert!(glob_match("*:user:*", "parley:user:42"));
        assert!(!glob_match("a*c*e", "abde"));
        assert!(!glob_match("ab*ba", "aba"));
    }

    #[test]
    fn message_topic() {
        let direct = BrokerMessage {
            channel: "c".into(),
            pattern: None,
            payload: String::new(),
        };
        assert_eq!(direct.topic(), Topic::Channel("c".into()));
        let matched = BrokerMessage {
            pattern: Some("c*".into()),
            ..direct
        };
        assert_eq!(matched.topic(), Topic::Pattern("c*".into()));
    }
}
