//! The response listener: one task draining every subscribed response topic.
//!
//! New subscriptions arrive over an mpsc channel from the multiplexer and are
//! merged into a [`SelectAll`].  Each message is decoded as a
//! [`ResponseEnvelope`] and handed to the pending table.  The same loop ticks
//! the reaper that drops entries past their deadline.
//!
//! The task returns `Ok(())` on shutdown and `Err` when the transport fails,
//! which the correlator's supervisor treats as listener death.

use std::sync::Arc;
use std::time::Duration;

use fiscal_bus::{BusMessage, Subscription, TransportError};
use fiscal_types::{BridgeError, ResponseEnvelope};
use futures_util::StreamExt;
use futures_util::stream::SelectAll;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::pending::PendingCalls;

pub(crate) async fn run_listener(
    mut subscriptions: mpsc::UnboundedReceiver<Subscription>,
    pending: Arc<PendingCalls>,
    mut shutdown: watch::Receiver<bool>,
    reap_interval: Duration,
) -> Result<(), TransportError> {
    let mut streams: SelectAll<Subscription> = SelectAll::new();
    let mut reaper = tokio::time::interval(reap_interval);
    reaper.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.changed() => return Ok(()),

            subscription = subscriptions.recv() => match subscription {
                Some(subscription) => streams.push(subscription),
                // The multiplexer detached us.
                None => return Ok(()),
            },

            Some(item) = streams.next(), if !streams.is_empty() => {
                let message = item?;
                match handle_message(&message, &pending) {
                    Ok(true) => {}
                    Ok(false) => debug!(topic = %message.topic, "response did not match a pending call"),
                    Err(e) => warn!(topic = %message.topic, error = %e, "dropping undecodable response"),
                }
            }

            _ = reaper.tick() => {
                pending.reap_expired(Instant::now());
            }
        }
    }
}

/// Decode one response and complete its caller.
///
/// Returns whether a pending call was completed.
pub(crate) fn handle_message(message: &BusMessage, pending: &PendingCalls) -> Result<bool, BridgeError> {
    let response: ResponseEnvelope = serde_json::from_str(&message.payload)
        .map_err(|e| BridgeError::MalformedMessage(e.to_string()))?;
    Ok(pending.fulfill(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fiscal_types::CommandId;
    use futures_util::stream;

    fn message(payload: &str) -> BusMessage {
        BusMessage {
            topic: "command_fr_default_response".to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        let pending = PendingCalls::new();
        let result = handle_message(&message("not json"), &pending);
        assert!(matches!(result, Err(BridgeError::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn listener_routes_responses_to_callers() {
        let pending = Arc::new(PendingCalls::new());
        let id = CommandId::new();
        let rx = pending.register(id.clone(), "default", "ping", Instant::now() + Duration::from_secs(5));

        let (tx, sub_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_listener(sub_rx, Arc::clone(&pending), shutdown_rx, Duration::from_millis(50)));

        let payload = format!(r#"{{"command_id":"{id}","success":true,"data":{{"pong":1}}}}"#);
        let items: Vec<Result<BusMessage, TransportError>> =
            vec![Ok(message("garbage")), Ok(message(&payload))];
        // Keep the stream open after the items so the listener does not see it end.
        let sub: Subscription = stream::iter(items).chain(stream::pending()).boxed();
        tx.send(sub).unwrap();

        let response = rx.await.unwrap().unwrap();
        assert!(response.success);

        shutdown_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn transport_error_ends_listener() {
        let pending = Arc::new(PendingCalls::new());
        let (tx, sub_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_listener(sub_rx, pending, shutdown_rx, Duration::from_millis(50)));

        let items: Vec<Result<BusMessage, TransportError>> = vec![Err(TransportError::Closed)];
        tx.send(stream::iter(items).boxed()).unwrap();

        assert_eq!(task.await.unwrap(), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn reaper_drops_expired_entries() {
        let pending = Arc::new(PendingCalls::new());
        let id = CommandId::new();
        let rx = pending.register(id.clone(), "default", "ping", Instant::now());

        let (_tx, sub_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_listener(sub_rx, Arc::clone(&pending), shutdown_rx, Duration::from_millis(10)));

        // The sender side closes once the entry is reaped.
        assert!(rx.await.is_err());
        assert!(!pending.contains(&id));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
