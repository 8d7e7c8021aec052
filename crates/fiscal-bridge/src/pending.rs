//! In-flight call table: command id → waiting caller.
//!
//! Each entry owns a oneshot sender.  Whoever removes the entry first
//! (response, timeout, reaper, or a listener failure) decides the outcome,
//! so a caller is completed at most once.  All operations are short critical
//! sections under one mutex and never await while holding it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fiscal_types::{BridgeError, CommandId, ResponseEnvelope};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// What a waiting caller eventually receives.
pub(crate) type CallResult = Result<ResponseEnvelope, BridgeError>;

struct PendingCall {
    slot: oneshot::Sender<CallResult>,
    deadline: Instant,
    device_id: String,
    operation: String,
}

/// Counters kept for diagnostics.
#[derive(Debug, Default)]
pub struct PendingStats {
    registered: AtomicU64,
    fulfilled: AtomicU64,
    expired: AtomicU64,
    unmatched: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`PendingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub registered: u64,
    pub fulfilled: u64,
    pub expired: u64,
    pub unmatched: u64,
    pub failed: u64,
}

impl PendingStats {
    pub fn snapshot(&self) -> PendingSnapshot {
        PendingSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            fulfilled: self.fulfilled.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<CommandId, PendingCall>>,
    stats: PendingStats,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a caller and return the receiver it will wait on.
    ///
    /// Must happen before the command is published so a fast response always
    /// finds its entry.
    pub(crate) fn register(
        &self,
        command_id: CommandId,
        device_id: &str,
        operation: &str,
        deadline: Instant,
    ) -> oneshot::Receiver<CallResult> {
        let (slot, receiver) = oneshot::channel();
        let call = PendingCall {
            slot,
            deadline,
            device_id: device_id.to_string(),
            operation: operation.to_string(),
        };
        self.lock().insert(command_id, call);
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        receiver
    }

    /// Complete the caller waiting on `response.command_id`.
    ///
    /// Returns `false` when nobody is waiting (late, duplicate, or foreign
    /// response); such responses are dropped.
    pub fn fulfill(&self, response: ResponseEnvelope) -> bool {
        let Some(call) = self.lock().remove(&response.command_id) else {
            self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
            debug!(command_id = %response.command_id, "dropping response with no pending call");
            return false;
        };
        self.stats.fulfilled.fetch_add(1, Ordering::Relaxed);
        if call.slot.send(Ok(response)).is_err() {
            debug!(
                device_id = %call.device_id,
                operation = %call.operation,
                "caller went away before its response arrived"
            );
        }
        true
    }

    /// Remove the entry for `command_id` without completing it.
    /// Returns `true` when the entry was still present.
    pub fn expire(&self, command_id: &CommandId) -> bool {
        let removed = self.lock().remove(command_id).is_some();
        if removed {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every entry whose deadline is at or before `now`.
    ///
    /// Reaped callers see their receiver close, which they treat as a timeout.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let reaped = {
            let mut calls = self.lock();
            let before = calls.len();
            calls.retain(|_, call| call.deadline > now);
            before - calls.len()
        };
        if reaped > 0 {
            self.stats.expired.fetch_add(reaped as u64, Ordering::Relaxed);
            debug!(reaped, "reaped expired pending calls");
        }
        reaped
    }

    /// Complete every waiting caller with [`BridgeError::TransportUnavailable`].
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            let _ = call
                .slot
                .send(Err(BridgeError::TransportUnavailable(reason.to_string())));
        }
        if count > 0 {
            self.stats.failed.fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    pub fn contains(&self, command_id: &CommandId) -> bool {
        self.lock().contains_key(command_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PendingSnapshot {
        self.stats.snapshot()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CommandId, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
