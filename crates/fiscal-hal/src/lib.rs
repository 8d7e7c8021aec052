//! # fiscal-hal
//!
//! Device-side building blocks for workers.
//!
//! - [`registry`] – [`OperationRegistry`], a name → handler table that
//!   implements [`OperationExecutor`][fiscal_bridge::OperationExecutor].
//! - [`sim`] – [`SimRegistrar`], a stateful simulated cash register used when
//!   no hardware is attached.

pub mod registry;
pub mod sim;

pub use registry::{Handler, OperationRegistry};
pub use sim::{SimHandle, SimRegistrar, SimState};
