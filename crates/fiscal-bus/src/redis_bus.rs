//! [`RedisBus`] – a [`Transport`] over Redis pub/sub.
//!
//! Publishing and pings go through one auto-reconnecting
//! [`ConnectionManager`].  All subscriptions share a single pub/sub
//! connection owned by a pump task; the pump re-publishes every Redis message
//! into a local [`MemoryBus`], from which the returned [`Subscription`]s are
//! drawn.
//!
//! When the pub/sub connection drops, the local bus is closed, so every
//! subscription yields [`TransportError::Closed`] and ends.  The next
//! `subscribe` opens a fresh pub/sub connection.

use std::collections::HashSet;
use std::pin::pin;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{Client, RedisError};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::{DEFAULT_CAPACITY, MemoryBus};
use crate::transport::{Subscription, Transport, TransportError};

/// Redis URL used when none is configured.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

impl From<RedisError> for TransportError {
    fn from(e: RedisError) -> Self {
        TransportError::Unavailable(e.to_string())
    }
}

pub struct RedisBus {
    client: Client,
    commands: ConnectionManager,
    link: Mutex<Option<Link>>,
    capacity: usize,
}

/// The live pub/sub connection: the local fan-out bus and the pump's inbox.
#[derive(Clone)]
struct Link {
    local: MemoryBus,
    requests: mpsc::UnboundedSender<SubscribeRequest>,
}

struct SubscribeRequest {
    topic: String,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

impl RedisBus {
    /// Open the command connection to `url`.
    ///
    /// The pub/sub connection is opened lazily on the first `subscribe`.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        Self::connect_with_capacity(url, DEFAULT_CAPACITY).await
    }

    /// `capacity` bounds the per-topic local buffer, as for [`MemoryBus::new`].
    pub async fn connect_with_capacity(url: &str, capacity: usize) -> Result<Self, TransportError> {
        let client = Client::open(url)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        info!("connected to redis");
        Ok(Self {
            client,
            commands,
            link: Mutex::new(None),
            capacity,
        })
    }

    async fn link(&self) -> Result<Link, TransportError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref()
            && !link.local.is_closed()
        {
            return Ok(link.clone());
        }

        let pubsub = self.client.get_async_pubsub().await?;
        let local = MemoryBus::new(self.capacity);
        let (requests, inbox) = mpsc::unbounded_channel();
        tokio::spawn(pump(pubsub, inbox, local.clone()));
        debug!("redis pub/sub connection opened");

        let link = Link { local, requests };
        *guard = Some(link.clone());
        Ok(link)
    }
}

#[async_trait]
impl Transport for RedisBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, TransportError> {
        let mut conn = self.commands.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let link = self.link().await?;
        // Local first, so nothing forwarded after the Redis SUBSCRIBE is lost.
        let subscription = link.local.subscribe(topic).await?;

        let (ack, done) = oneshot::channel();
        link.requests
            .send(SubscribeRequest {
                topic: topic.to_string(),
                ack,
            })
            .map_err(|_| TransportError::Closed)?;
        done.await.map_err(|_| TransportError::Closed)??;
        Ok(subscription)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut conn = self.commands.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

enum Event {
    Request(Option<SubscribeRequest>),
    Message(Option<redis::Msg>),
}

/// Own the pub/sub connection: serve SUBSCRIBE requests and forward every
/// message to `local` until the connection or the [`RedisBus`] goes away.
async fn pump(mut pubsub: PubSub, mut inbox: mpsc::UnboundedReceiver<SubscribeRequest>, local: MemoryBus) {
    let mut topics: HashSet<String> = HashSet::new();

    loop {
        let event = {
            let mut messages = pin!(pubsub.on_message());
            tokio::select! {
                request = inbox.recv() => Event::Request(request),
                message = messages.next() => Event::Message(message),
            }
        };

        match event {
            Event::Request(None) => break,
            Event::Request(Some(request)) => {
                let result = if topics.contains(&request.topic) {
                    Ok(())
                } else {
                    match pubsub.subscribe(&request.topic).await {
                        Ok(()) => {
                            debug!(topic = %request.topic, "redis channel subscribed");
                            topics.insert(request.topic);
                            Ok(())
                        }
                        Err(e) => Err(TransportError::from(e)),
                    }
                };
                let _ = request.ack.send(result);
            }
            Event::Message(Some(message)) => {
                let topic = message.get_channel_name().to_string();
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        let _ = local.publish(&topic, payload).await;
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "dropping non-text redis payload"),
                }
            }
            Event::Message(None) => {
                warn!("redis pub/sub connection lost");
                break;
            }
        }
    }

    local.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn invalid_url_is_unavailable() {
        let result = RedisBus::connect("not a redis url").await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }

    /// Needs a running server; set `FISCAL_TEST_REDIS_URL` and run with
    /// `--ignored`.
    #[tokio::test]
    #[ignore = "requires a Redis server"]
    async fn publish_reaches_subscriber_through_redis() -> Result<(), Box<dyn std::error::Error>> {
        let url = std::env::var("FISCAL_TEST_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        let bus = RedisBus::connect(&url).await?;
        bus.ping().await?;

        let topic = "fiscal_bus_redis_test";
        let mut sub = bus.subscribe(topic).await?;
        let mut again = bus.subscribe(topic).await?;

        let receivers = bus.publish(topic, "hello".to_string()).await?;
        assert_eq!(receivers, 1, "one shared pub/sub connection");

        let msg = tokio::time::timeout(Duration::from_secs(2), sub.next()).await?.ok_or("ended")??;
        assert_eq!(msg.payload, "hello");
        let msg = tokio::time::timeout(Duration::from_secs(2), again.next()).await?.ok_or("ended")??;
        assert_eq!(msg.topic, topic);
        Ok(())
    }
}
