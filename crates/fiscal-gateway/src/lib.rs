//! `fiscal-gateway` – the HTTP surface of the bridge.
//!
//! Every inbound request becomes one [`Correlator::call`]; the gateway keeps
//! no state of its own beyond the correlator handle.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fiscal_bridge::{Correlator, CorrelatorConfig};
//! use fiscal_bus::MemoryBus;
//! use fiscal_gateway::GatewayServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let correlator = Correlator::start(Arc::new(MemoryBus::default()), CorrelatorConfig::default()).await;
//!     GatewayServer::new(correlator)
//!         .with_port(8000)
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//!         .expect("gateway failed");
//! }
//! ```
//!
//! [`Correlator::call`]: fiscal_bridge::Correlator::call

pub mod server;

pub use server::{ApiError, DEFAULT_MAX_TIMEOUT, DEFAULT_PORT, GatewayError, GatewayServer};
