//! Redis-backed broker.
//!
//! Commands go over one multiplexed connection. Subscriptions live on a
//! dedicated pub/sub connection owned by a pump task; subscribe and
//! unsubscribe requests are sent to the pump so reading never blocks them.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{Msg, RedisResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::broker::{Broker, BrokerError, BrokerMessage, Topic};
use super::memory::INBOUND_CAPACITY;

enum Command {
    Subscribe(Topic, oneshot::Sender<RedisResult<()>>),
    Unsubscribe(Topic, oneshot::Sender<RedisResult<()>>),
}

enum Step {
    Command(Option<Command>),
    Message(Option<Msg>),
}

/// Broker over a Redis server.
pub struct RedisBroker {
    conn: MultiplexedConnection,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RedisBroker {
    /// Connect both the command and pub/sub connections.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<BrokerMessage>), BrokerError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async::<String>(&mut conn).await?;
        let pubsub = client.get_async_pubsub().await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(64);
        let pump = tokio::spawn(pump(pubsub, command_rx, inbound_tx));
        info!("redis broker connected");

        let broker = Self {
            conn,
            commands: Mutex::new(Some(command_tx)),
            pump: Mutex::new(Some(pump)),
        };
        Ok((broker, inbound_rx))
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<RedisResult<()>>) -> Command,
    ) -> Result<(), BrokerError> {
        let sender = self.commands.lock().clone().ok_or(BrokerError::Closed)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make(reply_tx))
            .await
            .map_err(|_| BrokerError::Closed)?;
        reply_rx.await.map_err(|_| BrokerError::Closed)??;
        Ok(())
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("open", &self.commands.lock().is_some())
            .finish_non_exhaustive()
    }
}

async fn pump(
    mut pubsub: PubSub,
    mut commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<BrokerMessage>,
) {
    loop {
        let step = {
            let mut messages = pubsub.on_message();
            tokio::select! {
                command = commands.recv() => Step::Command(command),
                message = messages.next() => Step::Message(message),
            }
        };
        match step {
            Step::Command(None) => break,
            Step::Command(Some(Command::Subscribe(topic, reply))) => {
                let result = match &topic {
                    Topic::Channel(name) => pubsub.subscribe(name).await,
                    Topic::Pattern(pattern) => pubsub.psubscribe(pattern).await,
                };
                let _ = reply.send(result);
            }
            Step::Command(Some(Command::Unsubscribe(topic, reply))) => {
                let result = match &topic {
                    Topic::Channel(name) => pubsub.unsubscribe(name).await,
                    Topic::Pattern(pattern) => pubsub.punsubscribe(pattern).await,
                };
                let _ = reply.send(result);
            }
            Step::Message(None) => {
                warn!("redis pub/sub stream ended");
                break;
            }
            Step::Message(Some(msg)) => {
                let Some(message) = convert(&msg) else {
                    continue;
                };
                if inbound.send(message).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("redis pub/sub pump stopped");
}

fn convert(msg: &Msg) -> Option<BrokerMessage> {
    let payload = match msg.get_payload::<String>() {
        Ok(payload) => payload,
        Err(error) => {
            warn!(channel = msg.get_channel_name(), %error, "non-text pub/sub payload");
            return None;
        }
    };
    let pattern = if msg.from_pattern() {
        msg.get_pattern::<String>().ok()
    } else {
        None
    };
    Some(BrokerMessage {
        channel: msg.get_channel_name().to_string(),
        pattern,
        payload,
    })
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), BrokerError> {
        let topic = topic.clone();
        self.request(|reply| Command::Subscribe(topic, reply)).await
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), BrokerError> {
        let topic = topic.clone();
        self.request(|reply| Command::Unsubscribe(topic, reply)).await
    }

    async fn presence_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(key)
            .arg(member)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn presence_refresh(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn presence_remove(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn presence_members(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let mut members = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async::<Vec<String>>(&mut conn)
            .await?;
        members.sort();
        Ok(members)
    }

    async fn close(&self) {
        // Dropping the sender ends the pump loop.
        let _ = self.commands.lock().take();
        let pump = self.pump.lock().take();
        if let Some(handle) = pump {
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                debug!("redis pub/sub pump did not stop in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_up_to_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
    }

    #[tokio::test]
    async fn connect_to_unreachable_server_fails() {
        let result = RedisBroker::connect("redis://127.0.0.1:1/").await;
        assert!(matches!(result, Err(BrokerError::Redis(_))));
    }

    #[tokio::test]
    async fn invalid_url_fails() {
        let result = RedisBroker::connect("not a url").await;
        assert!(result.is_err());
    }
}
