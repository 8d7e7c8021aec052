//! [`Correlator`] – turns publish/subscribe into awaitable calls.
//!
//! A call goes through three steps, in this order:
//!
//! 1. make sure the device's response topic is subscribed,
//! 2. register the pending entry for a fresh command id,
//! 3. publish the [`CommandEnvelope`] on the device's command topic.
//!
//! The caller then waits on its own oneshot for a response, a timeout, or a
//! listener failure, whichever comes first.  The pending entry is removed on
//! every exit path, including cancellation of the calling future.
//!
//! A supervisor task owns the response listener.  If the listener dies, every
//! in-flight call fails with [`BridgeError::TransportUnavailable`], new calls
//! fail fast, and the listener is restarted with exponential backoff when the
//! [`RestartPolicy`] allows it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fiscal_bus::{Transport, TransportError};
use fiscal_types::{Arguments, BridgeError, CommandEnvelope, CommandId};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channels::{AddressingMode, ChannelMultiplexer};
use crate::health::{BridgeHealth, HealthCell, RestartPolicy};
use crate::listener::run_listener;
use crate::pending::{CallResult, PendingCalls, PendingSnapshot};

/// Timeout used by [`Correlator::call_with_default_timeout`] unless configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub addressing: AddressingMode,
    pub default_timeout: Duration,
    pub restart: RestartPolicy,
    /// How often the listener sweeps entries past their deadline.
    pub reap_interval: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            addressing: AddressingMode::default(),
            default_timeout: DEFAULT_TIMEOUT,
            restart: RestartPolicy::default(),
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

/// Successful result of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub data: Option<Value>,
    pub message: Option<String>,
}

/// Cheap to clone; all clones share one listener and one pending table.
#[derive(Clone)]
pub struct Correlator {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    multiplexer: ChannelMultiplexer,
    pending: Arc<PendingCalls>,
    health: HealthCell,
    /// Bumped every time a listener is declared dead.
    listener_epoch: AtomicU64,
    config: CorrelatorConfig,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

type ListenerHandle = JoinHandle<Result<(), TransportError>>;

impl Correlator {
    /// Ping the transport, start the response listener, and return.
    ///
    /// An unreachable transport does not fail startup: the correlator comes up
    /// [`BridgeHealth::Unhealthy`] and the supervisor keeps retrying if
    /// restarts are enabled.
    pub async fn start(transport: Arc<dyn Transport>, config: CorrelatorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            multiplexer: ChannelMultiplexer::new(Arc::clone(&transport), config.addressing),
            transport,
            pending: Arc::new(PendingCalls::new()),
            health: HealthCell::new(BridgeHealth::Starting),
            listener_epoch: AtomicU64::new(0),
            config,
            shutdown,
            supervisor: Mutex::new(None),
        });

        let first = shared.launch_listener().await;
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), first));
        *shared
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(supervisor);

        Self { shared }
    }

    /// Send `operation` to `device_id` and wait up to `timeout` for the answer.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::TransportUnavailable`] – the correlator is not healthy,
    ///   the transport failed, no worker listens on the command topic, or the
    ///   listener died while waiting.
    /// * [`BridgeError::Timeout`] – no response within `timeout`.
    /// * [`BridgeError::WorkerReportedFailure`] – the worker answered with
    ///   `success: false`.
    pub async fn call(
        &self,
        device_id: &str,
        operation: &str,
        arguments: Arguments,
        timeout: Duration,
    ) -> Result<Reply, BridgeError> {
        self.ensure_healthy()?;
        let epoch = self.shared.listener_epoch.load(Ordering::SeqCst);

        let channels = self.shared.multiplexer.ensure_subscribed(device_id).await?;

        let envelope = CommandEnvelope::new(device_id, operation, arguments);
        let command_id = envelope.command_id.clone();
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| BridgeError::TransportUnavailable(format!("could not encode command: {e}")))?;

        let (mut slot, _guard) = self.register_pending(epoch, &command_id, device_id, operation, timeout)?;

        let receivers = self
            .shared
            .transport
            .publish(&channels.command_topic, payload)
            .await
            .map_err(|e| BridgeError::TransportUnavailable(e.to_string()))?;
        if receivers == 0 {
            return Err(BridgeError::TransportUnavailable(format!(
                "no worker is subscribed to {}",
                channels.command_topic
            )));
        }
        debug!(device_id, operation, command_id = %command_id, "command published");

        let timed_out = || BridgeError::Timeout {
            device_id: device_id.to_string(),
            operation: operation.to_string(),
            command_id: command_id.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };

        let result = match tokio::time::timeout(timeout, &mut slot).await {
            Ok(Ok(result)) => result,
            // The reaper removed the entry: its deadline passed.
            Ok(Err(_)) => Err(timed_out()),
            Err(_) => {
                if self.shared.pending.expire(&command_id) {
                    Err(timed_out())
                } else {
                    // Completed concurrently with the timer; honour the result.
                    slot.try_recv().unwrap_or_else(|_| Err(timed_out()))
                }
            }
        };

        match result {
            Ok(response) if response.success => Ok(Reply {
                data: response.data,
                message: response.message,
            }),
            Ok(response) => {
                let err = BridgeError::from_failed_response(response);
                debug!(device_id, operation, command_id = %command_id, error = %err, "worker reported failure");
                Err(err)
            }
            Err(err) => {
                warn!(device_id, operation, command_id = %command_id, error = %err, "call failed");
                Err(err)
            }
        }
    }

    pub async fn call_with_default_timeout(
        &self,
        device_id: &str,
        operation: &str,
        arguments: Arguments,
    ) -> Result<Reply, BridgeError> {
        let timeout = self.shared.config.default_timeout;
        self.call(device_id, operation, arguments, timeout).await
    }

    pub fn health(&self) -> BridgeHealth {
        self.shared.health.get()
    }

    pub fn addressing(&self) -> AddressingMode {
        self.shared.config.addressing
    }

    pub fn default_timeout(&self) -> Duration {
        self.shared.config.default_timeout
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn pending_stats(&self) -> PendingSnapshot {
        self.shared.pending.stats()
    }

    /// Response topics the listener currently drains.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.shared.multiplexer.subscribed_topics()
    }

    /// Stop the listener and the supervisor, failing any in-flight calls.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let supervisor = self
            .shared
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!(error = %e, "correlator supervisor did not exit cleanly");
            }
        }
        self.shared.health.stop();
        self.shared.multiplexer.detach();
        let failed = self.shared.pending.fail_all("correlator shut down");
        info!(failed, "correlator stopped");
    }

    /// Register the pending entry, then confirm the listener that owns the
    /// subscription is still the one running.  A listener that died after
    /// `epoch` was read has already swept the table and would never answer.
    fn register_pending<'a>(
        &'a self,
        epoch: u64,
        command_id: &'a CommandId,
        device_id: &str,
        operation: &str,
        timeout: Duration,
    ) -> Result<(oneshot::Receiver<CallResult>, PendingGuard<'a>), BridgeError> {
        let slot = self
            .shared
            .pending
            .register(command_id.clone(), device_id, operation, deadline_after(timeout));
        let guard = PendingGuard {
            pending: &self.shared.pending,
            command_id,
        };
        if self.shared.listener_epoch.load(Ordering::SeqCst) != epoch {
            return Err(BridgeError::TransportUnavailable(
                "response listener restarted during call".to_string(),
            ));
        }
        self.ensure_healthy()?;
        Ok((slot, guard))
    }

    fn ensure_healthy(&self) -> Result<(), BridgeError> {
        match self.health() {
            BridgeHealth::Healthy => Ok(()),
            other => Err(BridgeError::TransportUnavailable(format!(
                "correlator is {other}"
            ))),
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Removes the pending entry when the call future completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    command_id: &'a CommandId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.expire(self.command_id);
    }
}

impl Shared {
    async fn launch_listener(&self) -> Result<ListenerHandle, TransportError> {
        self.transport.ping().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.multiplexer.attach(tx);
        let handle = tokio::spawn(run_listener(
            rx,
            Arc::clone(&self.pending),
            self.shutdown.subscribe(),
            self.config.reap_interval,
        ));
        self.health.set(BridgeHealth::Healthy);
        info!(addressing = %self.config.addressing, "response listener started");
        Ok(handle)
    }

    fn mark_unhealthy(&self, reason: &str) {
        self.health.set(BridgeHealth::Unhealthy);
        self.listener_epoch.fetch_add(1, Ordering::SeqCst);
        self.multiplexer.detach();
        let failed = self.pending.fail_all(reason);
        error!(reason, failed, "correlator unhealthy");
    }
}

async fn supervise(shared: Arc<Shared>, first: Result<ListenerHandle, TransportError>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut launch = first;
    let mut attempt: u32 = 0;

    loop {
        match launch {
            Ok(listener) => {
                let started = Instant::now();
                let outcome = listener.await;
                if *shutdown.borrow() {
                    break;
                }
                let reason = match outcome {
                    Ok(Ok(())) => "response listener exited".to_string(),
                    Ok(Err(e)) => format!("response listener failed: {e}"),
                    Err(e) if e.is_panic() => "response listener panicked".to_string(),
                    Err(e) => format!("response listener aborted: {e}"),
                };
                shared.mark_unhealthy(&reason);
                // A listener that ran for a while earns a fresh backoff.
                if started.elapsed() >= shared.config.restart.max_backoff {
                    attempt = 0;
                }
            }
            Err(e) => {
                shared.mark_unhealthy(&format!("transport unreachable: {e}"));
            }
        }

        if !shared.config.restart.enabled {
            warn!("listener restart disabled; correlator stays unhealthy");
            break;
        }

        let delay = shared.config.restart.backoff(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        launch = shared.launch_listener().await;
        if launch.is_ok() {
            info!(attempt, "response listener restarted");
        }
    }
    debug!("correlator supervisor exiting");
}
