//! [`OperationRegistry`] – name → handler table.
//!
//! The registry is the worker's view of one device: every operation name the
//! device understands maps to a handler.  It implements
//! [`OperationExecutor`], so a registry can be handed straight to
//! [`Worker::with_device`][fiscal_bridge::Worker::with_device].

use std::collections::BTreeMap;

use fiscal_bridge::{ExecutionError, ExecutionOutput, OperationExecutor};
use fiscal_types::Arguments;
use tracing::debug;

/// Handler for one named operation.
pub type Handler = Box<dyn Fn(&Arguments) -> Result<ExecutionOutput, ExecutionError> + Send + Sync>;

/// Operation table for one device.
///
/// Construct with [`OperationRegistry::new`], register handlers, then pass it
/// to a worker.
#[derive(Default)]
pub struct OperationRegistry {
    handlers: BTreeMap<String, Handler>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.  A previous handler with the same name is replaced.
    pub fn register<F>(&mut self, operation: impl Into<String>, handler: F)
    where
        F: Fn(&Arguments) -> Result<ExecutionOutput, ExecutionError> + Send + Sync + 'static,
    {
        self.handlers.insert(operation.into(), Box::new(handler));
    }

    /// Builder-style [`register`][Self::register].
    pub fn with<F>(mut self, operation: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Arguments) -> Result<ExecutionOutput, ExecutionError> + Send + Sync + 'static,
    {
        self.register(operation, handler);
        self
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl OperationExecutor for OperationRegistry {
    fn execute(&self, operation: &str, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        let handler = self
            .handlers
            .get(operation)
            .ok_or_else(|| ExecutionError::UnknownOperation(operation.to_string()))?;
        debug!(operation, "dispatching to handler");
        handler(arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatches_by_name() {
        let registry = OperationRegistry::new()
            .with("ping", |_| Ok(ExecutionOutput::data(json!({"pong": true}))))
            .with("fail", |_| Err(ExecutionError::device(44, "out of paper")));

        let out = registry.execute("ping", &Arguments::new()).unwrap();
        assert_eq!(out.data, Some(json!({"pong": true})));
        assert_eq!(
            registry.execute("fail", &Arguments::new()),
            Err(ExecutionError::device(44, "out of paper"))
        );
    }

    #[test]
    fn unknown_operation() {
        let registry = OperationRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(
            registry.execute("fly", &Arguments::new()),
            Err(ExecutionError::UnknownOperation("fly".to_string()))
        );
    }

    #[test]
    fn re_registering_replaces() {
        let mut registry = OperationRegistry::new();
        registry.register("op", |_| Ok(ExecutionOutput::message("first")));
        registry.register("op", |_| Ok(ExecutionOutput::message("second")));

        assert_eq!(registry.len(), 1);
        let out = registry.execute("op", &Arguments::new()).unwrap();
        assert_eq!(out.message.as_deref(), Some("second"));
    }

    #[test]
    fn operations_are_sorted() {
        let registry = OperationRegistry::new()
            .with("b", |_| Ok(ExecutionOutput::empty()))
            .with("a", |_| Ok(ExecutionOutput::empty()));
        assert_eq!(registry.operations(), vec!["a", "b"]);
        assert!(registry.contains("a"));
    }
}
