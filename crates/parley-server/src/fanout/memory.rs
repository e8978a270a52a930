//! In-process broker with Redis-like semantics.
//!
//! A [`MemoryHub`] stands in for the Redis server; each [`MemoryBroker`]
//! connected to it behaves like one process's Redis client. Used for
//! single-node deployments and for multi-instance tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use super::broker::{Broker, BrokerError, BrokerMessage, Topic, glob_match};

/// Capacity of each client's inbound queue.
pub const INBOUND_CAPACITY: usize = 1024;

struct Subscriber {
    topics: HashSet<Topic>,
    tx: mpsc::Sender<BrokerMessage>,
}

struct PresenceSet {
    members: HashSet<String>,
    expires_at: Instant,
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<u64, Subscriber>,
    presence: HashMap<String, PresenceSet>,
}

impl HubState {
    fn live_presence(&mut self, key: &str) -> Option<&mut PresenceSet> {
        if self
            .presence
            .get(key)
            .is_some_and(|set| set.expires_at <= Instant::now())
        {
            let _ = self.presence.remove(key);
        }
        self.presence.get_mut(key)
    }
}

/// Shared message bus; clone freely.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    next_client: Arc<AtomicU64>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client. Messages for its subscriptions arrive on the receiver.
    pub fn connect(&self) -> (MemoryBroker, mpsc::Receiver<BrokerMessage>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let _ = self.state.lock().subscribers.insert(
            client_id,
            Subscriber {
                topics: HashSet::new(),
                tx,
            },
        );
        let broker = MemoryBroker {
            hub: self.clone(),
            client_id,
            closed: AtomicBool::new(false),
        };
        (broker, rx)
    }

    /// Number of connected clients subscribed to anything.
    pub fn active_subscribers(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .values()
            .filter(|s| !s.topics.is_empty())
            .count()
    }

    fn deliver(&self, channel: &str, payload: &str) {
        let state = self.state.lock();
        for (client_id, subscriber) in &state.subscribers {
            for topic in &subscriber.topics {
                let pattern = match topic {
                    Topic::Channel(name) if name == channel => None,
                    Topic::Pattern(p) if glob_match(p, channel) => Some(p.clone()),
                    _ => continue,
                };
                let message = BrokerMessage {
                    channel: channel.to_string(),
                    pattern,
                    payload: payload.to_string(),
                };
                if subscriber.tx.try_send(message).is_err() {
                    warn!(client_id, channel, "memory broker subscriber queue full, dropping");
                }
            }
        }
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryHub")
            .field("clients", &state.subscribers.len())
            .field("presence_keys", &state.presence.len())
            .finish()
    }
}

/// One client of a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryBroker {
    hub: MemoryHub,
    client_id: u64,
    closed: AtomicBool,
}

impl MemoryBroker {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn with_topics(&self, f: impl FnOnce(&mut HashSet<Topic>)) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock();
        let subscriber = state
            .subscribers
            .get_mut(&self.client_id)
            .ok_or(BrokerError::Closed)?;
        f(&mut subscriber.topics);
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.hub.deliver(channel, &payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), BrokerError> {
        self.with_topics(|topics| {
            let _ = topics.insert(topic.clone());
        })
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), BrokerError> {
        self.with_topics(|topics| {
            let _ = topics.remove(topic);
        })
    }

    async fn presence_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock();
        let expires_at = Instant::now() + ttl;
        match state.live_presence(key) {
            Some(set) => {
                let _ = set.members.insert(member.to_string());
                set.expires_at = expires_at;
            }
            None => {
                let _ = state.presence.insert(
                    key.to_string(),
                    PresenceSet {
                        members: HashSet::from([member.to_string()]),
                        expires_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn presence_refresh(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if let Some(set) = self.hub.state.lock().live_presence(key) {
            set.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn presence_remove(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock();
        let now_empty = state.live_presence(key).is_some_and(|set| {
            let _ = set.members.remove(member);
            set.members.is_empty()
        });
        if now_empty {
            let _ = state.presence.remove(key);
        }
        Ok(())
    }

    async fn presence_members(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock();
        let mut members: Vec<String> = state
            .live_presence(key)
            .map(|set| set.members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.hub.state.lock().subscribers.remove(&self.client_id);
        }
    }
}
