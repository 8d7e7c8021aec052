//! [`BridgeHealth`] – liveness of the correlator's response listener.
//!
//! The correlator is only as healthy as the single task draining its response
//! topics.  When that task dies the supervisor flips the state to
//! [`BridgeHealth::Unhealthy`], fails every in-flight call, and (depending on
//! the [`RestartPolicy`]) starts a new listener after a backoff delay.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state reported by the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeHealth {
    /// The listener has not been started yet.
    Starting,
    /// The listener is running; calls are accepted.
    Healthy,
    /// The listener died; calls fail fast until it is restarted.
    Unhealthy,
    /// The correlator was shut down.
    Stopped,
}

impl BridgeHealth {
    pub fn is_healthy(self) -> bool {
        self == BridgeHealth::Healthy
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BridgeHealth::Starting,
            1 => BridgeHealth::Healthy,
            2 => BridgeHealth::Unhealthy,
            _ => BridgeHealth::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BridgeHealth::Starting => 0,
            BridgeHealth::Healthy => 1,
            BridgeHealth::Unhealthy => 2,
            BridgeHealth::Stopped => 3,
        }
    }
}

impl fmt::Display for BridgeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeHealth::Starting => "starting",
            BridgeHealth::Healthy => "healthy",
            BridgeHealth::Unhealthy => "unhealthy",
            BridgeHealth::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Lock-free cell read on every call.
#[derive(Debug)]
pub(crate) struct HealthCell(AtomicU8);

impl HealthCell {
    pub(crate) fn new(initial: BridgeHealth) -> Self {
        Self(AtomicU8::new(initial.as_u8()))
    }

    pub(crate) fn get(&self) -> BridgeHealth {
        BridgeHealth::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Set the state unless the cell is already [`BridgeHealth::Stopped`].
    /// Returns the previous state.
    pub(crate) fn set(&self, next: BridgeHealth) -> BridgeHealth {
        let stopped = BridgeHealth::Stopped.as_u8();
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != stopped).then_some(next.as_u8())
            })
            .unwrap_or(stopped);
        BridgeHealth::from_u8(previous)
    }

    pub(crate) fn stop(&self) {
        self.0.store(BridgeHealth::Stopped.as_u8(), Ordering::SeqCst);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Restart policy
// ────────────────────────────────────────────────────────────────────────────

/// Whether and how fast a dead listener (or dispatcher subscription) is
/// brought back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    /// Never restart; stay unhealthy after the first failure.
    pub fn never() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before restart attempt number `attempt` (0-based): the initial
    /// backoff doubled per attempt, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_round_trips_every_state() {
        let cell = HealthCell::new(BridgeHealth::Starting);
        assert_eq!(cell.get(), BridgeHealth::Starting);
        for state in [BridgeHealth::Healthy, BridgeHealth::Unhealthy, BridgeHealth::Healthy] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn stopped_is_terminal() {
        let cell = HealthCell::new(BridgeHealth::Healthy);
        cell.stop();
        assert_eq!(cell.set(BridgeHealth::Healthy), BridgeHealth::Stopped);
        assert_eq!(cell.get(), BridgeHealth::Stopped);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            enabled: true,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(1));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn never_disables_restart() {
        assert!(!RestartPolicy::never().enabled);
        assert!(RestartPolicy::default().enabled);
    }

    #[test]
    fn health_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&BridgeHealth::Unhealthy).unwrap(), "\"unhealthy\"");
        assert_eq!(BridgeHealth::Healthy.to_string(), "healthy");
    }
}
