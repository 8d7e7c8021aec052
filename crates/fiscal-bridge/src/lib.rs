//! # fiscal-bridge
//!
//! Request/response correlation over a publish/subscribe transport.
//!
//! ```text
//!  caller ──call()──► Correlator ──publish──► command_fr_{device}
//!                        ▲                          │
//!                        │                     Dispatcher ──► OperationExecutor
//!                        │                          │
//!                     Listener ◄──subscribe── command_fr_{device}_response
//! ```
//!
//! * [`Correlator`] – caller side; one listener task per process, one
//!   pending entry per in-flight call.
//! * [`ChannelMultiplexer`] – device id → topic pair, subscribe-once.
//! * [`Dispatcher`] / [`Worker`] – worker side; one sequential consumer per
//!   command topic.
//! * [`OperationExecutor`] – the device driver seam.

pub mod channels;
pub mod correlator;
pub mod dispatcher;
pub mod executor;
pub mod health;
mod listener;
pub mod pending;

pub use channels::{AddressingMode, ChannelMultiplexer, DeviceChannels, SHARED_COMMAND_TOPIC, channels_for};
pub use correlator::{Correlator, CorrelatorConfig, DEFAULT_TIMEOUT, Reply};
pub use dispatcher::{Dispatcher, Worker, WorkerHandle};
pub use executor::{ExecutionError, ExecutionOutput, OperationExecutor};
pub use health::{BridgeHealth, RestartPolicy};
pub use pending::{PendingCalls, PendingSnapshot};
