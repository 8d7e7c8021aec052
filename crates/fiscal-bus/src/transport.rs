//! The transport seam.
//!
//! The bridge never speaks to a broker directly.  It publishes and subscribes
//! through [`Transport`], which models a plain publish/subscribe bus with
//! named string topics: no request/reply, no ordering across topics,
//! at-most-once delivery.  [`MemoryBus`][crate::bus::MemoryBus] is the
//! in-process implementation and [`RedisBus`][crate::redis_bus::RedisBus]
//! the broker-backed one.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// One message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

/// Stream of messages for a single topic.
///
/// Yields `Err(TransportError::Closed)` once when the transport goes away and
/// then ends.
pub type Subscription = BoxStream<'static, Result<BusMessage, TransportError>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Every publish/subscribe backend must implement this trait.
///
/// # Contract
///
/// * `publish` – hand `payload` to every current subscriber of `topic` and
///   return how many there were.  Zero subscribers is not an error.
///
/// * `subscribe` – the returned [`Subscription`] is live as soon as the call
///   returns; messages published afterwards are buffered for it even before
///   it is first polled.
///
/// * `ping` – cheap reachability check used at startup and before restarts.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;

    async fn ping(&self) -> Result<(), TransportError>;
}
