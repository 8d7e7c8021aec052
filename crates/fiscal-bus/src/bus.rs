//! In-process, topic-based publish/subscribe bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  Topics are plain strings created on first use, which is what
//! the per-device naming scheme needs (`command_fr_<device>` and friends).
//!
//! All clones of a [`MemoryBus`] share one channel map, so a process holds a
//! single "connection" no matter how many devices it talks to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::transport::{BusMessage, Subscription, Transport, TransportError};

/// Default per-topic capacity (number of buffered messages before old ones
/// are dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 1024;

/// Shared in-process bus. Clone it cheaply – all clones share the same
/// underlying broadcast channels.
#[derive(Clone, Debug)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Debug)]
struct BusInner {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    closed: AtomicBool,
}

impl MemoryBus {
    /// Create a new bus with the given per-topic capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                topics: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Shut the bus down.
    ///
    /// Every live subscription yields [`TransportError::Closed`] once its
    /// buffered messages are drained; later publishes and subscribes fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.topics().clear();
        debug!("memory bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, TransportError> {
        self.ensure_open()?;
        let topics = self.topics();
        match topics.get(topic) {
            // A send error only means nobody is listening right now.
            Some(sender) => Ok(sender.send(payload).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let receiver = {
            let mut topics = self.topics();
            let capacity = self.inner.capacity;
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(capacity).0)
                .subscribe()
        };
        debug!(topic, "subscribed");
        Ok(into_subscription(topic.to_string(), receiver))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.ensure_open()
    }
}

// ---------------------------------------------------------------------------
// Receiver → Subscription stream
// ---------------------------------------------------------------------------

fn into_subscription(topic: String, receiver: broadcast::Receiver<String>) -> Subscription {
    stream::unfold(Some(receiver), move |state| {
        let topic = topic.clone();
        async move {
            let mut receiver = state?;
            loop {
                match receiver.recv().await {
                    Ok(payload) => {
                        return Some((Ok(BusMessage { topic, payload }), Some(receiver)));
                    }
                    Err(RecvError::Lagged(n)) => {
                        // Subscriber fell behind; the skipped messages are lost.
                        warn!(topic = %topic, lagged_by = n, "subscription lagged");
                    }
                    Err(RecvError::Closed) => return Some((Err(TransportError::Closed), None)),
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MemoryBus::default();
        let mut sub = bus.subscribe("command_fr_default").await?;

        let delivered = bus.publish("command_fr_default", "hello".to_string()).await?;
        assert_eq!(delivered, 1);

        let msg = sub.next().await.ok_or("stream ended")??;
        assert_eq!(msg.topic, "command_fr_default");
        assert_eq!(msg.payload, "hello");
        Ok(())
    }

    #[tokio::test]
    async fn publish_without_subscribers_reports_zero() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MemoryBus::default();
        assert_eq!(bus.publish("nobody_home", "x".to_string()).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_message() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MemoryBus::default();
        let mut first = bus.subscribe("t").await?;
        let mut second = bus.subscribe("t").await?;

        assert_eq!(bus.publish("t", "m".to_string()).await?, 2);

        assert_eq!(first.next().await.ok_or("ended")??.payload, "m");
        assert_eq!(second.next().await.ok_or("ended")??.payload, "m");
        Ok(())
    }

    /// A subscriber on one topic must never see traffic for another topic.
    #[tokio::test]
    async fn subscriber_does_not_receive_other_topic() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MemoryBus::default();
        let mut a = bus.subscribe("command_fr_a").await?;
        let _b = bus.subscribe("command_fr_b").await?;

        bus.publish("command_fr_b", "for b".to_string()).await?;

        let result = tokio::time::timeout(Duration::from_millis(50), a.next()).await;
        assert!(result.is_err(), "topic a must not receive a message for b");
        Ok(())
    }

    /// Messages published after `subscribe` returns are buffered even when
    /// the stream has not been polled yet.
    #[tokio::test]
    async fn subscription_buffers_before_first_poll() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MemoryBus::default();
        let mut sub = bus.subscribe("t").await?;
        bus.publish("t", "1".to_string()).await?;
        bus.publish("t", "2".to_string()).await?;

        assert_eq!(sub.next().await.ok_or("ended")??.payload, "1");
        assert_eq!(sub.next().await.ok_or("ended")??.payload, "2");
        Ok(())
    }

    /// Flooding a small channel loses the oldest messages but the subscriber
    /// keeps receiving instead of erroring out.
    #[tokio::test]
    async fn slow_subscriber_skips_lagged_messages() -> Result<(), Box<dyn std::error::Error>> {
        const CAPACITY: usize = 8;
        let bus = MemoryBus::new(CAPACITY);
        let mut slow = bus.subscribe("flood").await?;

        for i in 0..100 {
            bus.publish("flood", i.to_string()).await?;
        }

        let first = slow.next().await.ok_or("ended")??;
        let index: usize = first.payload.parse()?;
        assert!(index >= 100 - CAPACITY, "expected only the newest messages, got {index}");
        Ok(())
    }

    #[tokio::test]
    async fn close_ends_subscriptions_with_closed_error() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MemoryBus::default();
        let mut sub = bus.subscribe("t").await?;

        bus.close();

        assert_eq!(sub.next().await, Some(Err(TransportError::Closed)));
        assert!(sub.next().await.is_none());
        assert!(matches!(bus.subscribe("t").await, Err(TransportError::Closed)));
        assert_eq!(bus.publish("t", "x".to_string()).await, Err(TransportError::Closed));
        assert_eq!(bus.ping().await, Err(TransportError::Closed));
        Ok(())
    }

    #[tokio::test]
    async fn clones_share_topics() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MemoryBus::default();
        let clone = bus.clone();
        let mut sub = bus.subscribe("shared").await?;

        clone.publish("shared", "via clone".to_string()).await?;
        assert_eq!(sub.next().await.ok_or("ended")??.payload, "via clone");
        assert_eq!(clone.subscriber_count("shared"), 1);
        Ok(())
    }
}
