//! Worker side: consume commands, execute them, publish responses.
//!
//! A [`Dispatcher`] owns one command topic and processes its commands one at
//! a time, so a device never sees overlapping operations.  Different
//! dispatchers (different devices) run concurrently.
//!
//! [`Worker`] is the builder that wires executors to topics according to the
//! addressing mode and spawns one dispatcher task per command topic.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use fiscal_bus::{Subscription, Transport, TransportError};
use fiscal_types::{BridgeError, CommandEnvelope, CommandId, ResponseEnvelope};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::{AddressingMode, DeviceChannels, channels_for};
use crate::executor::OperationExecutor;
use crate::health::RestartPolicy;

/// Keep-alive payload some publishers send on command topics.
const KEEPALIVE_PAYLOAD: &str = "ping";

enum Route {
    /// Per-device topic: every command goes to this one executor.
    Device {
        device_id: String,
        executor: Arc<dyn OperationExecutor>,
    },
    /// Shared topic: the envelope's `device_id` picks the executor.
    Shared(BTreeMap<String, Arc<dyn OperationExecutor>>),
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    channels: DeviceChannels,
    route: Route,
}

impl Dispatcher {
    /// Serve `device_id` on its own topic pair.
    pub fn for_device(
        transport: Arc<dyn Transport>,
        device_id: impl Into<String>,
        executor: Arc<dyn OperationExecutor>,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            transport,
            channels: channels_for(AddressingMode::PerDevice, &device_id),
            route: Route::Device { device_id, executor },
        }
    }

    /// Serve every device in `executors` on the shared topic pair.
    pub fn shared(
        transport: Arc<dyn Transport>,
        executors: BTreeMap<String, Arc<dyn OperationExecutor>>,
    ) -> Self {
        Self {
            transport,
            channels: channels_for(AddressingMode::Shared, ""),
            route: Route::Shared(executors),
        }
    }

    pub fn command_topic(&self) -> &str {
        &self.channels.command_topic
    }

    pub fn response_topic(&self) -> &str {
        &self.channels.response_topic
    }

    pub async fn subscribe(&self) -> Result<Subscription, TransportError> {
        self.transport.subscribe(&self.channels.command_topic).await
    }

    /// Process commands from `subscription` until `shutdown` flips.
    ///
    /// A command already executing is finished and answered before the loop
    /// observes shutdown.  When the subscription fails it is re-established
    /// with backoff according to `restart`.
    pub async fn run(
        self,
        subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
        restart: RestartPolicy,
    ) {
        let mut subscription = subscription;
        info!(topic = %self.channels.command_topic, "dispatcher started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                item = subscription.next() => match item {
                    Some(Ok(message)) => {
                        if let Some(response) = self.handle_payload(&message.payload).await {
                            self.reply(&response).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(topic = %self.channels.command_topic, error = %e, "command subscription failed");
                        match self.resubscribe(&mut shutdown, &restart).await {
                            Some(next) => subscription = next,
                            None => break,
                        }
                    }
                    None => {
                        warn!(topic = %self.channels.command_topic, "command subscription ended");
                        match self.resubscribe(&mut shutdown, &restart).await {
                            Some(next) => subscription = next,
                            None => break,
                        }
                    }
                },
            }
        }
        info!(topic = %self.channels.command_topic, "dispatcher stopped");
    }

    /// Turn one raw command payload into the response to publish, if any.
    ///
    /// Keep-alives and payloads without a recoverable `command_id` produce no
    /// response; everything else does, including failures.
    pub async fn handle_payload(&self, payload: &str) -> Option<ResponseEnvelope> {
        if payload.trim() == KEEPALIVE_PAYLOAD {
            return None;
        }

        match serde_json::from_str::<CommandEnvelope>(payload) {
            Ok(envelope) => Some(self.execute(envelope).await),
            Err(parse_error) => match recover_command_id(payload) {
                Some(command_id) => {
                    warn!(command_id = %command_id, error = %parse_error, "malformed command");
                    Some(ResponseEnvelope::failure(
                        command_id,
                        format!("malformed command: {parse_error}"),
                        None,
                    ))
                }
                None => {
                    let err = BridgeError::MalformedMessage(parse_error.to_string());
                    warn!(topic = %self.channels.command_topic, error = %err, "dropping command without command_id");
                    None
                }
            },
        }
    }

    async fn execute(&self, envelope: CommandEnvelope) -> ResponseEnvelope {
        let CommandEnvelope {
            command_id,
            command,
            device_id,
            kwargs,
            ..
        } = envelope;

        let executor = match self.resolve(&device_id) {
            Ok(executor) => executor,
            Err(message) => {
                warn!(device_id = %device_id, operation = %command, command_id = %command_id, "{message}");
                return ResponseEnvelope::failure(command_id, message, None);
            }
        };

        info!(device_id = %device_id, operation = %command, command_id = %command_id, "executing command");
        let operation = command.clone();
        let joined = tokio::task::spawn_blocking(move || executor.execute(&operation, &kwargs)).await;

        match joined {
            Ok(Ok(output)) => {
                debug!(operation = %command, command_id = %command_id, "command succeeded");
                ResponseEnvelope::success(command_id, output.data, output.message)
            }
            Ok(Err(err)) => {
                warn!(operation = %command, command_id = %command_id, error = %err, "command failed");
                ResponseEnvelope::failure(command_id, err.to_string(), err.details())
            }
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                let message = format!("executor panicked during '{command}': {reason}");
                let err = BridgeError::ExecutorPanic(reason);
                error!(operation = %command, command_id = %command_id, error = %err, "executor crashed");
                ResponseEnvelope::failure(command_id, message, None)
            }
        }
    }

    fn resolve(&self, device_id: &str) -> Result<Arc<dyn OperationExecutor>, String> {
        match &self.route {
            Route::Device {
                device_id: own,
                executor,
            } => {
                if device_id.is_empty() || device_id == own {
                    Ok(Arc::clone(executor))
                } else {
                    Err(format!(
                        "command for device '{device_id}' arrived on the topic of '{own}'"
                    ))
                }
            }
            Route::Shared(executors) => {
                if device_id.is_empty() && executors.len() == 1 {
                    // Legacy clients omit the device id.
                    return executors
                        .values()
                        .next()
                        .cloned()
                        .ok_or_else(|| "no devices registered".to_string());
                }
                executors
                    .get(device_id)
                    .cloned()
                    .ok_or_else(|| format!("unknown device '{device_id}'"))
            }
        }
    }

    async fn reply(&self, response: &ResponseEnvelope) {
        let payload = match serde_json::to_string(response) {
            Ok(payload) => payload,
            Err(e) => {
                error!(command_id = %response.command_id, error = %e, "could not encode response");
                return;
            }
        };
        match self.transport.publish(&self.channels.response_topic, payload).await {
            Ok(0) => debug!(command_id = %response.command_id, "response published with no listener"),
            Ok(_) => debug!(command_id = %response.command_id, "response published"),
            Err(e) => error!(command_id = %response.command_id, error = %e, "failed to publish response"),
        }
    }

    async fn resubscribe(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        restart: &RestartPolicy,
    ) -> Option<Subscription> {
        let mut attempt: u32 = 0;
        while restart.enabled {
            let delay = restart.backoff(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(shutdown) => return None,
            }
            match self.subscribe().await {
                Ok(subscription) => {
                    info!(topic = %self.channels.command_topic, attempt, "command subscription restored");
                    return Some(subscription);
                }
                Err(e) => {
                    warn!(topic = %self.channels.command_topic, attempt, error = %e, "resubscribe failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
        None
    }
}

/// Resolves once shutdown is requested.  A dropped sender never requests it,
/// so the dispatchers of a dropped [`WorkerHandle`] keep serving.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn recover_command_id(payload: &str) -> Option<CommandId> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value
        .get("command_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(CommandId::from)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Worker
// ────────────────────────────────────────────────────────────────────────────

/// Builder for the worker process: register devices, then [`Worker::start`].
///
/// ```no_run
/// # use std::sync::Arc;
/// # use fiscal_bus::MemoryBus;
/// # use fiscal_bridge::{AddressingMode, ExecutionError, ExecutionOutput, Worker};
/// # use fiscal_types::Arguments;
/// # async fn demo() -> Result<(), fiscal_bus::TransportError> {
/// let bus = Arc::new(MemoryBus::default());
/// let worker = Worker::new(bus, AddressingMode::PerDevice)
///     .with_device("kkt-1", |_: &str, _: &Arguments| -> Result<_, ExecutionError> {
///         Ok(ExecutionOutput::empty())
///     })
///     .start()
///     .await?;
/// worker.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Worker {
    transport: Arc<dyn Transport>,
    addressing: AddressingMode,
    devices: BTreeMap<String, Arc<dyn OperationExecutor>>,
    restart: RestartPolicy,
}

impl Worker {
    pub fn new(transport: Arc<dyn Transport>, addressing: AddressingMode) -> Self {
        Self {
            transport,
            addressing,
            devices: BTreeMap::new(),
            restart: RestartPolicy::default(),
        }
    }

    pub fn with_device(self, device_id: impl Into<String>, executor: impl OperationExecutor) -> Self {
        self.with_shared_device(device_id, Arc::new(executor))
    }

    /// Register an executor that is already behind an `Arc`.
    pub fn with_shared_device(
        mut self,
        device_id: impl Into<String>,
        executor: Arc<dyn OperationExecutor>,
    ) -> Self {
        self.devices.insert(device_id.into(), executor);
        self
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Subscribe every command topic, then spawn the dispatchers.
    ///
    /// All subscriptions are live when this returns, so a command published
    /// afterwards is never missed.
    pub async fn start(self) -> Result<WorkerHandle, TransportError> {
        let dispatchers: Vec<Dispatcher> = match self.addressing {
            AddressingMode::PerDevice => self
                .devices
                .into_iter()
                .map(|(device_id, executor)| {
                    Dispatcher::for_device(Arc::clone(&self.transport), device_id, executor)
                })
                .collect(),
            AddressingMode::Shared if self.devices.is_empty() => Vec::new(),
            AddressingMode::Shared => vec![Dispatcher::shared(Arc::clone(&self.transport), self.devices)],
        };

        if dispatchers.is_empty() {
            warn!("worker started with no devices");
        }

        let mut subscribed = Vec::with_capacity(dispatchers.len());
        for dispatcher in dispatchers {
            let subscription = dispatcher.subscribe().await?;
            subscribed.push((dispatcher, subscription));
        }

        let (shutdown, _) = watch::channel(false);
        let mut topics = Vec::with_capacity(subscribed.len());
        let mut tasks = Vec::with_capacity(subscribed.len());
        for (dispatcher, subscription) in subscribed {
            topics.push(dispatcher.command_topic().to_string());
            tasks.push(tokio::spawn(dispatcher.run(
                subscription,
                shutdown.subscribe(),
                self.restart.clone(),
            )));
        }

        info!(addressing = %self.addressing, topics = ?topics, "worker started");
        Ok(WorkerHandle {
            shutdown,
            tasks,
            topics,
        })
    }
}

/// Running worker.  Dropping the handle leaves the dispatchers running.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    topics: Vec<String>,
}

impl WorkerHandle {
    pub fn command_topics(&self) -> &[String] {
        &self.topics
    }

    /// Stop every dispatcher after its current command and wait for them.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "dispatcher task did not exit cleanly");
            }
        }
        info!("worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionError, ExecutionOutput};
    use fiscal_bus::MemoryBus;
    use fiscal_types::Arguments;
    use serde_json::json;

    fn echo(operation: &str, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        match operation {
            "fail" => Err(ExecutionError::device(44, "out of paper")),
            "boom" => panic!("printer caught fire"),
            _ => Ok(ExecutionOutput::data(json!({"op": operation, "args": arguments}))),
        }
    }

    fn device_dispatcher() -> Dispatcher {
        Dispatcher::for_device(Arc::new(MemoryBus::default()), "kkt-1", Arc::new(echo))
    }

    fn command(device_id: &str, operation: &str) -> String {
        serde_json::to_string(&CommandEnvelope::new(device_id, operation, Arguments::new())).unwrap()
    }

    #[tokio::test]
    async fn keepalive_is_ignored() {
        assert!(device_dispatcher().handle_payload("ping").await.is_none());
    }

    #[tokio::test]
    async fn success_carries_data() {
        let response = device_dispatcher()
            .handle_payload(&command("kkt-1", "shift_open"))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.data.unwrap()["op"], "shift_open");
    }

    #[tokio::test]
    async fn device_error_message_is_verbatim() {
        let response = device_dispatcher().handle_payload(&command("", "fail")).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("out of paper"));
        assert_eq!(response.data.unwrap()["error_code"], 44);
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let response = device_dispatcher().handle_payload(&command("kkt-1", "boom")).await.unwrap();
        assert!(!response.success);
        let message = response.message.unwrap();
        assert!(message.contains("printer caught fire"), "{message}");
    }

    #[tokio::test]
    async fn malformed_with_command_id_gets_failure() {
        let response = device_dispatcher()
            .handle_payload(r#"{"command_id":"abc","kwargs":[]}"#)
            .await
            .unwrap();
        assert_eq!(response.command_id.as_str(), "abc");
        assert!(!response.success);
    }

    #[tokio::test]
    async fn malformed_without_command_id_is_dropped() {
        assert!(device_dispatcher().handle_payload("{not json").await.is_none());
        assert!(device_dispatcher().handle_payload(r#"{"command":"x"}"#).await.is_none());
    }

    #[tokio::test]
    async fn wrong_device_on_per_device_topic_is_rejected() {
        let response = device_dispatcher()
            .handle_payload(&command("kkt-2", "ping"))
            .await
            .unwrap();
        assert!(!response.success);
    }

    #[tokio::test]
    async fn shared_routing_by_device_id() {
        let mut executors: BTreeMap<String, Arc<dyn OperationExecutor>> = BTreeMap::new();
        executors.insert("a".into(), Arc::new(echo));
        executors.insert("b".into(), Arc::new(echo));
        let dispatcher = Dispatcher::shared(Arc::new(MemoryBus::default()), executors);
        assert_eq!(dispatcher.command_topic(), "command_fr_channel");

        assert!(dispatcher.handle_payload(&command("b", "ping")).await.unwrap().success);

        let unknown = dispatcher.handle_payload(&command("zzz", "ping")).await.unwrap();
        assert_eq!(unknown.message.as_deref(), Some("unknown device 'zzz'"));

        // Ambiguous without a device id when several devices share the topic.
        assert!(!dispatcher.handle_payload(&command("", "ping")).await.unwrap().success);
    }

    #[tokio::test]
    async fn shared_routing_defaults_to_single_device() {
        let mut executors: BTreeMap<String, Arc<dyn OperationExecutor>> = BTreeMap::new();
        executors.insert("only".into(), Arc::new(echo));
        let dispatcher = Dispatcher::shared(Arc::new(MemoryBus::default()), executors);
        assert!(dispatcher.handle_payload(&command("", "ping")).await.unwrap().success);
    }

    #[tokio::test]
    async fn worker_subscribes_before_returning() {
        let bus = MemoryBus::default();
        let worker = Worker::new(Arc::new(bus.clone()), AddressingMode::PerDevice)
            .with_device("a", echo)
            .with_device("b", echo)
            .start()
            .await
            .unwrap();

        assert_eq!(worker.command_topics(), ["command_fr_a", "command_fr_b"]);
        assert_eq!(bus.subscriber_count("command_fr_a"), 1);
        assert_eq!(bus.subscriber_count("command_fr_b"), 1);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_the_handle_keeps_dispatchers_subscribed() {
        let bus = MemoryBus::default();
        let worker = Worker::new(Arc::new(bus.clone()), AddressingMode::PerDevice)
            .with_device("a", echo)
            .start()
            .await
            .unwrap();

        drop(worker);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(bus.subscriber_count("command_fr_a"), 1);
    }

    #[tokio::test]
    async fn shutdown_signal_ignores_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited = tokio::time::timeout(std::time::Duration::from_millis(50), shutdown_requested(&mut rx)).await;
        assert!(waited.is_err(), "a dropped sender must not request shutdown");

        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        shutdown_requested(&mut rx).await;
    }
}
