//! Message routing: local sockets first, then the broker.
//!
//! Business code pushes events through [`MessageRouter`] and never sees
//! sockets or the broker. Delivery is best effort; every method returns the
//! number of local sockets the event was queued on.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parley_core::{ConversationDirectory, ConversationId, DeviceId, EventSink, ServerEvent, UserId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::fanout::{FanoutAdapter, FanoutEnvelope, FanoutHandler, SubscriptionId, Target, Topic};
use crate::websocket::manager::ConnectionManager;

/// Routes events to devices, users, conversations, or everyone.
pub struct MessageRouter {
    connections: Arc<ConnectionManager>,
    fanout: Arc<FanoutAdapter>,
    directory: Arc<dyn ConversationDirectory>,
    user_subscriptions: Mutex<HashMap<UserId, SubscriptionId>>,
    conversation_subscription: Mutex<Option<SubscriptionId>>,
    this: Weak<MessageRouter>,
}

impl MessageRouter {
    /// Build the router. It is only useful behind an `Arc`, since its fanout
    /// handlers hold a weak reference back to it.
    pub fn new(
        connections: Arc<ConnectionManager>,
        fanout: Arc<FanoutAdapter>,
        directory: Arc<dyn ConversationDirectory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            connections,
            fanout,
            directory,
            user_subscriptions: Mutex::new(HashMap::new()),
            conversation_subscription: Mutex::new(None),
            this: this.clone(),
        })
    }

    fn handler(&self) -> Arc<dyn FanoutHandler> {
        Arc::new(RouterHandler(self.this.clone()))
    }

    /// Subscribe to the conversation channel pattern so conversation events
    /// published elsewhere reach members connected here.
    pub async fn start(&self) {
        let mut slot = self.conversation_subscription.lock().await;
        if slot.is_some() {
            return;
        }
        let topic = Topic::Pattern(self.fanout.conversation_pattern());
        *slot = self.fanout.subscribe(topic, self.handler()).await;
    }

    /// Write to one local device.
    pub fn send_to_device(&self, device_id: &DeviceId, event: &ServerEvent) -> bool {
        self.connections.send(device_id, event)
    }

    /// Deliver to the user's local devices and publish to their channel.
    ///
    /// The publish always happens: the user may have devices on other
    /// instances even when some are local.
    pub async fn send_to_user(&self, user_id: &UserId, event: &ServerEvent) -> usize {
        let delivered = self.connections.send_to_user(user_id, event);
        let _ = self.fanout.publish_to_user(user_id, event).await;
        delivered
    }

    /// [`send_to_user`](Self::send_to_user) for each user except `exclude`.
    pub async fn send_to_users(
        &self,
        user_ids: &[UserId],
        event: &ServerEvent,
        exclude: Option<&UserId>,
    ) -> usize {
        let mut delivered = 0;
        for user_id in user_ids {
            if Some(user_id) == exclude {
                continue;
            }
            delivered += self.send_to_user(user_id, event).await;
        }
        delivered
    }

    /// Deliver to every current member of a conversation except `exclude`.
    ///
    /// Local members are reached directly. One envelope goes to the
    /// conversation channel; receiving instances resolve membership again.
    /// Unknown conversations reach nobody.
    pub async fn send_to_conversation(
        &self,
        conversation_id: &ConversationId,
        event: &ServerEvent,
        exclude: Option<&UserId>,
    ) -> usize {
        let delivered = match self.directory.participants(conversation_id).await {
            Ok(Some(members)) => self.deliver_to_members(&members, event, exclude),
            Ok(None) => {
                debug!(conversation_id = %conversation_id, "send to unknown conversation");
                return 0;
            }
            Err(error) => {
                warn!(conversation_id = %conversation_id, %error, "membership lookup failed");
                0
            }
        };
        let excluded: Vec<UserId> = exclude.into_iter().cloned().collect();
        let _ = self
            .fanout
            .publish_to_conversation(conversation_id, event, excluded)
            .await;
        delivered
    }

    /// Write to every local connection. Never published.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        self.connections.broadcast(event)
    }

    /// Apply an envelope that another instance published.
    pub async fn handle_remote(&self, envelope: FanoutEnvelope) -> usize {
        let FanoutEnvelope { event, target, .. } = envelope;
        match target {
            Target::User { id } => self.connections.send_to_user(&id, &event),
            Target::Device { id } => usize::from(self.connections.send(&id, &event)),
            Target::Conversation {
                id,
                exclude_user_ids,
            } => match self.directory.participants(&id).await {
                Ok(Some(members)) => {
                    let targets: Vec<UserId> = members
                        .into_iter()
                        .filter(|m| !exclude_user_ids.contains(m))
                        .collect();
                    self.deliver_to_members(&targets, &event, None)
                }
                Ok(None) => 0,
                Err(error) => {
                    warn!(conversation_id = %id, %error, "membership lookup failed for remote event");
                    0
                }
            },
            Target::Broadcast => self.connections.broadcast(&event),
        }
    }

    /// Subscribe to the user's channel once, however many devices connect.
    pub async fn ensure_user_subscription(&self, user_id: &UserId) {
        let mut subs = self.user_subscriptions.lock().await;
        if subs.contains_key(user_id) {
            return;
        }
        let topic = Topic::Channel(self.fanout.user_channel(user_id));
        if let Some(id) = self.fanout.subscribe(topic, self.handler()).await {
            let _ = subs.insert(user_id.clone(), id);
        }
    }

    /// Drop the user's channel subscription once no local device remains.
    pub async fn release_user_subscription(&self, user_id: &UserId) {
        let mut subs = self.user_subscriptions.lock().await;
        // Checked under the lock so a concurrent reconnect keeps its subscription.
        if self.connections.is_user_online(user_id) {
            return;
        }
        if let Some(id) = subs.remove(user_id) {
            let _ = self.fanout.unsubscribe(id).await;
        }
    }

    /// Users this instance currently holds a channel subscription for.
    pub async fn subscribed_user_count(&self) -> usize {
        self.user_subscriptions.lock().await.len()
    }

    fn deliver_to_members(
        &self,
        members: &[UserId],
        event: &ServerEvent,
        exclude: Option<&UserId>,
    ) -> usize {
        members
            .iter()
            .filter(|m| Some(*m) != exclude)
            .map(|m| self.connections.send_to_user(m, event))
            .sum()
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("fanout", &self.fanout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventSink for MessageRouter {
    async fn send_to_user(&self, user_id: &UserId, event: &ServerEvent) -> usize {
        MessageRouter::send_to_user(self, user_id, event).await
    }
}

struct RouterHandler(Weak<MessageRouter>);

#[async_trait]
impl FanoutHandler for RouterHandler {
    async fn handle(&self, envelope: FanoutEnvelope) {
        if let Some(router) = self.0.upgrade() {
            let delivered = router.handle_remote(envelope).await;
            debug!(delivered, "remote envelope delivered");
        }
    }
}
