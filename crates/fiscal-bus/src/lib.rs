//! `fiscal-bus` – publish/subscribe plumbing
//!
//! Moves opaque string payloads between the HTTP side and the device workers
//! without caring about their meaning.
//!
//! # Modules
//!
//! - [`transport`] – the [`Transport`] trait every pub/sub backend implements.
//! - [`bus`] – [`MemoryBus`], an in-process backend built on Tokio broadcast
//!   channels.
//! - [`redis_bus`] – [`RedisBus`], the cross-process backend over Redis
//!   pub/sub.

pub mod bus;
pub mod redis_bus;
pub mod transport;

pub use bus::{DEFAULT_CAPACITY, MemoryBus};
pub use redis_bus::{DEFAULT_REDIS_URL, RedisBus};
pub use transport::{BusMessage, Subscription, Transport, TransportError};
