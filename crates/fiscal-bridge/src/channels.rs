//! [`ChannelMultiplexer`] – device id → topic pair, plus the subscription set.
//!
//! Topic names are derived by [`channels_for`], a pure function of the
//! addressing mode and the device id:
//!
//! | Mode | Command topic | Response topic |
//! |---|---|---|
//! | [`AddressingMode::PerDevice`] | `command_fr_{device}` | `command_fr_{device}_response` |
//! | [`AddressingMode::Shared`] | `command_fr_channel` | `command_fr_channel_response` |
//!
//! In shared mode every device maps to the same pair and the device id only
//! travels inside the envelope.
//!
//! The multiplexer also owns the set of response topics the listener drains.
//! Each response topic is subscribed exactly once, however many callers race
//! on first use; the new subscription is handed to the listener through a
//! channel rather than deduplicated by the listener itself.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fiscal_bus::{Subscription, Transport};
use fiscal_types::BridgeError;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, mpsc};
use tracing::info;

const TOPIC_PREFIX: &str = "command_fr_";
const RESPONSE_SUFFIX: &str = "_response";

/// Command topic of the shared (legacy) addressing mode.
pub const SHARED_COMMAND_TOPIC: &str = "command_fr_channel";

/// How device ids map onto transport topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// One topic pair per device. Isolates devices from each other.
    #[default]
    PerDevice,
    /// One topic pair for every device; `device_id` is carried in the payload.
    Shared,
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressingMode::PerDevice => write!(f, "per_device"),
            AddressingMode::Shared => write!(f, "shared"),
        }
    }
}

impl FromStr for AddressingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_device" | "per-device" | "device" => Ok(AddressingMode::PerDevice),
            "shared" | "legacy" => Ok(AddressingMode::Shared),
            other => Err(format!("unknown addressing mode '{other}'")),
        }
    }
}

/// The (command, response) topic pair used to reach one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceChannels {
    pub command_topic: String,
    pub response_topic: String,
}

/// Derive the topic pair for `device_id`.
pub fn channels_for(mode: AddressingMode, device_id: &str) -> DeviceChannels {
    let command_topic = match mode {
        AddressingMode::PerDevice => format!("{TOPIC_PREFIX}{device_id}"),
        AddressingMode::Shared => SHARED_COMMAND_TOPIC.to_string(),
    };
    let response_topic = format!("{command_topic}{RESPONSE_SUFFIX}");
    DeviceChannels {
        command_topic,
        response_topic,
    }
}

/// Caches topic pairs per device and subscribes response topics on first use.
pub struct ChannelMultiplexer {
    mode: AddressingMode,
    transport: Arc<dyn Transport>,
    channels: Mutex<HashMap<String, Arc<DeviceChannels>>>,
    // Keyed by response topic, so shared mode subscribes once for all devices.
    subscriptions: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
    listener: Mutex<Option<mpsc::UnboundedSender<Subscription>>>,
}

impl ChannelMultiplexer {
    pub fn new(transport: Arc<dyn Transport>, mode: AddressingMode) -> Self {
        Self {
            mode,
            transport,
            channels: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> AddressingMode {
        self.mode
    }

    /// Return the cached topic pair for `device_id`, creating it on first use.
    /// A pair never changes once created.
    pub fn get_or_create_channels(&self, device_id: &str) -> Arc<DeviceChannels> {
        let mut channels = lock(&self.channels);
        if let Some(existing) = channels.get(device_id) {
            return Arc::clone(existing);
        }
        let created = Arc::new(channels_for(self.mode, device_id));
        channels.insert(device_id.to_string(), Arc::clone(&created));
        created
    }

    /// Make sure the listener drains the response topic of `device_id`.
    ///
    /// Concurrent first callers for the same topic wait on one subscription
    /// attempt; a failed attempt is retried by the next caller.
    ///
    /// # Errors
    ///
    /// [`BridgeError::TransportUnavailable`] when no listener is attached or
    /// the transport refuses the subscription.
    pub async fn ensure_subscribed(&self, device_id: &str) -> Result<Arc<DeviceChannels>, BridgeError> {
        let channels = self.get_or_create_channels(device_id);
        let cell = {
            let mut subscriptions = lock(&self.subscriptions);
            Arc::clone(
                subscriptions
                    .entry(channels.response_topic.clone())
                    .or_default(),
            )
        };
        cell.get_or_try_init(|| self.subscribe_response_topic(&channels.response_topic))
            .await?;
        Ok(channels)
    }

    /// Response topics with a live subscription.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.subscriptions)
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Point new subscriptions at a freshly started listener and forget every
    /// subscription the previous listener owned.
    pub(crate) fn attach(&self, listener: mpsc::UnboundedSender<Subscription>) {
        lock(&self.subscriptions).clear();
        *lock(&self.listener) = Some(listener);
    }

    /// Drop the listener handle and the subscription set.
    pub(crate) fn detach(&self) {
        *lock(&self.listener) = None;
        lock(&self.subscriptions).clear();
    }

    async fn subscribe_response_topic(&self, topic: &str) -> Result<(), BridgeError> {
        let listener = lock(&self.listener).clone();
        let Some(listener) = listener else {
            return Err(BridgeError::TransportUnavailable(
                "response listener is not running".to_string(),
            ));
        };

        let subscription = self
            .transport
            .subscribe(topic)
            .await
            .map_err(|e| BridgeError::TransportUnavailable(e.to_string()))?;

        listener.send(subscription).map_err(|_| {
            BridgeError::TransportUnavailable("response listener stopped".to_string())
        })?;

        info!(topic, "listening for responses");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
