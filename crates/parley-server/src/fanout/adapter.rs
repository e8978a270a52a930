//! [`FanoutAdapter`]: envelopes, channel naming, refcounted subscriptions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parley_core::metric::{FANOUT_PUBLISHED_TOTAL, FANOUT_SELF_DROPPED_TOTAL};
use parley_core::{ConversationId, DeviceId, ServerEvent, UserId};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::InstanceId;
use super::broker::{Broker, BrokerMessage, Topic};
use super::envelope::{FanoutEnvelope, Target};

/// Receives envelopes published by other instances.
#[async_trait]
pub trait FanoutHandler: Send + Sync {
    /// Handle one remote envelope.
    async fn handle(&self, envelope: FanoutEnvelope);
}

/// Handle returned by [`FanoutAdapter::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscriptions {
    by_topic: HashMap<Topic, HashMap<SubscriptionId, Arc<dyn FanoutHandler>>>,
    topic_of: HashMap<SubscriptionId, Topic>,
}

impl Subscriptions {
    fn handlers_for(&self, topic: &Topic) -> Vec<Arc<dyn FanoutHandler>> {
        self.by_topic
            .get(topic)
            .map(|handlers| handlers.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Cross-process pub/sub bridge.
///
/// With no broker every operation is a no-op: publishes report `false`,
/// subscriptions are not registered, presence is empty.
pub struct FanoutAdapter {
    broker: Option<Arc<dyn Broker>>,
    instance_id: InstanceId,
    prefix: String,
    presence_ttl: Duration,
    subscriptions: Arc<Mutex<Subscriptions>>,
    next_subscription: AtomicU64,
    closed: CancellationToken,
    dispatch: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl FanoutAdapter {
    /// Bridge over `broker`, reading its deliveries from `inbound`.
    ///
    /// Spawns the dispatch task, so this must run inside a Tokio runtime.
    pub fn new(
        broker: Arc<dyn Broker>,
        inbound: mpsc::Receiver<BrokerMessage>,
        prefix: impl Into<String>,
        presence_ttl: Duration,
    ) -> Self {
        let instance_id = InstanceId::generate();
        let subscriptions = Arc::new(Mutex::new(Subscriptions::default()));
        let closed = CancellationToken::new();
        let dispatch = tokio::spawn(dispatch_loop(
            inbound,
            instance_id.clone(),
            Arc::clone(&subscriptions),
            closed.clone(),
        ));
        info!(instance_id = %instance_id, "fanout enabled");
        Self {
            broker: Some(broker),
            instance_id,
            prefix: prefix.into(),
            presence_ttl,
            subscriptions,
            next_subscription: AtomicU64::new(1),
            closed,
            dispatch: parking_lot::Mutex::new(Some(dispatch)),
        }
    }

    /// A no-op adapter for single-process deployments without a broker.
    pub fn disabled(prefix: impl Into<String>) -> Self {
        Self {
            broker: None,
            instance_id: InstanceId::generate(),
            prefix: prefix.into(),
            presence_ttl: Duration::from_secs(60),
            subscriptions: Arc::new(Mutex::new(Subscriptions::default())),
            next_subscription: AtomicU64::new(1),
            closed: CancellationToken::new(),
            dispatch: parking_lot::Mutex::new(None),
        }
    }

    /// Whether a broker is attached and the adapter is not closed.
    pub fn is_enabled(&self) -> bool {
        self.broker.is_some() && !self.closed.is_cancelled()
    }

    /// This process's instance id.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// `{prefix}:user:{id}`.
    pub fn user_channel(&self, user_id: &UserId) -> String {
        format!("{}:user:{user_id}", self.prefix)
    }

    /// `{prefix}:conversation:{id}`.
    pub fn conversation_channel(&self, conversation_id: &ConversationId) -> String {
        format!("{}:conversation:{conversation_id}", self.prefix)
    }

    /// Pattern matching every conversation channel.
    pub fn conversation_pattern(&self) -> String {
        format!("{}:conversation:*", self.prefix)
    }

    fn presence_key(&self, user_id: &UserId) -> String {
        format!("{}:presence:{user_id}", self.prefix)
    }

    fn broker(&self) -> Option<&Arc<dyn Broker>> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.broker.as_ref()
    }

    /// Publish `event` for `target` on `channel`. Returns whether the broker
    /// accepted it.
    pub async fn publish(&self, channel: &str, event: &ServerEvent, target: Target) -> bool {
        let Some(broker) = self.broker() else {
            return false;
        };
        let kind = match &target {
            Target::User { .. } => "user",
            Target::Device { .. } => "device",
            Target::Conversation { .. } => "conversation",
            Target::Broadcast => "broadcast",
        };
        let envelope = FanoutEnvelope {
            event: event.clone(),
            target,
            source_instance_id: self.instance_id.clone(),
        };
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(channel, %error, "failed to encode fanout envelope");
                return false;
            }
        };
        match broker.publish(channel, payload).await {
            Ok(()) => {
                counter!(FANOUT_PUBLISHED_TOTAL, "kind" => kind).increment(1);
                true
            }
            Err(error) => {
                warn!(channel, %error, "fanout publish failed");
                false
            }
        }
    }

    /// Publish to every device of `user_id` on other instances.
    pub async fn publish_to_user(&self, user_id: &UserId, event: &ServerEvent) -> bool {
        let channel = self.user_channel(user_id);
        self.publish(
            &channel,
            event,
            Target::User {
                id: user_id.clone(),
            },
        )
        .await
    }

    /// Publish once for a conversation; receivers resolve membership.
    pub async fn publish_to_conversation(
        &self,
        conversation_id: &ConversationId,
        event: &ServerEvent,
        exclude_user_ids: Vec<UserId>,
    ) -> bool {
        let channel = self.conversation_channel(conversation_id);
        self.publish(
            &channel,
            event,
            Target::Conversation {
                id: conversation_id.clone(),
                exclude_user_ids,
            },
        )
        .await
    }

    /// Attach `handler` to `topic`.
    ///
    /// The broker subscription is created for the first handler of a topic
    /// and shared by later ones. Returns `None` when disabled or when the
    /// broker refused the subscription.
    pub async fn subscribe(
        &self,
        topic: Topic,
        handler: Arc<dyn FanoutHandler>,
    ) -> Option<SubscriptionId> {
        let broker = self.broker()?;
        let mut subs = self.subscriptions.lock().await;
        if !subs.by_topic.contains_key(&topic) {
            if let Err(error) = broker.subscribe(&topic).await {
                warn!(?topic, %error, "fanout subscribe failed");
                return None;
            }
            debug!(?topic, "fanout subscribed");
        }
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let _ = subs
            .by_topic
            .entry(topic.clone())
            .or_default()
            .insert(id, handler);
        let _ = subs.topic_of.insert(id, topic);
        Some(id)
    }

    /// Detach a handler. The broker unsubscribe fires when the last handler
    /// of a topic goes. Returns `false` for unknown ids.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.lock().await;
        let Some(topic) = subs.topic_of.remove(&id) else {
            return false;
        };
        let now_empty = subs.by_topic.get_mut(&topic).is_some_and(|handlers| {
            let _ = handlers.remove(&id);
            handlers.is_empty()
        });
        if now_empty {
            let _ = subs.by_topic.remove(&topic);
            if let Some(broker) = self.broker() {
                if let Err(error) = broker.unsubscribe(&topic).await {
                    warn!(?topic, %error, "fanout unsubscribe failed");
                } else {
                    debug!(?topic, "fanout unsubscribed");
                }
            }
        }
        true
    }

    /// Number of local handlers attached to `topic`.
    pub async fn handler_count(&self, topic: &Topic) -> usize {
        self.subscriptions
            .lock()
            .await
            .by_topic
            .get(topic)
            .map_or(0, HashMap::len)
    }

    /// Record `device_id` in the user's shared presence set.
    pub async fn presence_add(&self, user_id: &UserId, device_id: &DeviceId) {
        let Some(broker) = self.broker() else { return };
        let key = self.presence_key(user_id);
        if let Err(error) = broker.presence_add(&key, device_id.as_str(), self.presence_ttl).await {
            warn!(user_id = %user_id, %error, "presence add failed");
        }
    }

    /// Extend the TTL of the user's presence set.
    pub async fn presence_refresh(&self, user_id: &UserId) {
        let Some(broker) = self.broker() else { return };
        let key = self.presence_key(user_id);
        if let Err(error) = broker.presence_refresh(&key, self.presence_ttl).await {
            debug!(user_id = %user_id, %error, "presence refresh failed");
        }
    }

    /// Drop `device_id` from the user's shared presence set.
    pub async fn presence_remove(&self, user_id: &UserId, device_id: &DeviceId) {
        let Some(broker) = self.broker() else { return };
        let key = self.presence_key(user_id);
        if let Err(error) = broker.presence_remove(&key, device_id.as_str()).await {
            warn!(user_id = %user_id, %error, "presence remove failed");
        }
    }

    /// Devices of `user_id` present on any instance.
    pub async fn presence_devices(&self, user_id: &UserId) -> Vec<DeviceId> {
        let Some(broker) = self.broker() else {
            return Vec::new();
        };
        let key = self.presence_key(user_id);
        match broker.presence_members(&key).await {
            Ok(members) => members.into_iter().map(DeviceId::from).collect(),
            Err(error) => {
                warn!(user_id = %user_id, %error, "presence lookup failed");
                Vec::new()
            }
        }
    }

    /// Stop dispatching, drop handlers and close the broker. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let dispatch = self.dispatch.lock().take();
        if let Some(handle) = dispatch {
            let _ = handle.await;
        }
        let mut subs = self.subscriptions.lock().await;
        subs.by_topic.clear();
        subs.topic_of.clear();
        drop(subs);
        if let Some(broker) = &self.broker {
            broker.close().await;
        }
        info!(instance_id = %self.instance_id, "fanout closed");
    }
}

impl std::fmt::Debug for FanoutAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutAdapter")
            .field("instance_id", &self.instance_id)
            .field("prefix", &self.prefix)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

async fn dispatch_loop(
    mut inbound: mpsc::Receiver<BrokerMessage>,
    instance_id: InstanceId,
    subscriptions: Arc<Mutex<Subscriptions>>,
    closed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = closed.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let envelope = match FanoutEnvelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(channel = %message.channel, %error, "dropping undecodable fanout message");
                continue;
            }
        };
        if envelope.source_instance_id == instance_id {
            counter!(FANOUT_SELF_DROPPED_TOTAL).increment(1);
            continue;
        }
        let handlers = subscriptions.lock().await.handlers_for(&message.topic());
        for handler in handlers {
            handler.handle(envelope.clone()).await;
        }
    }
    debug!("fanout dispatch stopped");
}
