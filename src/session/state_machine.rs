//! [`EnableStateMachine`]: the enable/keep-alive/disable handshake and the
//! hit/byte counters it flushes on every successful keep-alive (spec.md
//! §4.6).
//!
//! State is guarded by a `parking_lot::RwLock` — transitions are
//! synchronous and must never be held across a network round-trip
//! (spec.md §5, "Sub-cluster lock"), matching the short-critical-section
//! style the teacher uses for its auth state in `enterprise::auth::jwt`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::storage::StorageSet;

use super::protocol::{parse_hash_mismatch, DisableAck, EnableAck, KeepAliveAck};
use super::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    Connecting,
    Connected,
    Enabling,
    Enabled,
    Disabling,
}

/// A pair of monotonic counters that can be snapshotted and partially
/// drained without losing concurrent increments (spec.md §4.6: "any
/// concurrent increments during the round-trip remain for the next
/// tick").
#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    fn add(&self, hits: u64, bytes: u64) {
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }

    fn subtract(&self, hits: u64, bytes: u64) {
        self.hits.fetch_sub(hits, Ordering::Relaxed);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Drives one sub-cluster through `OFFLINE -> CONNECTING -> CONNECTED ->
/// ENABLING -> ENABLED -> DISABLING -> OFFLINE`.
pub struct EnableStateMachine {
    state: RwLock<SessionState>,
    reconnect_count: AtomicU32,
    /// `0` = no retry, exit on first drop. `<0` = retry forever.
    max_reconnect_count: i64,
    wait_enable: Notify,
    /// Since-last-successful-keep-alive counters, flushed on ack.
    counters: Counters,
    /// Session-long counters that are never drained (spec.md §3: the
    /// source never reads these back, but the distinction is preserved).
    stat_only: Counters,
    storage: Arc<StorageSet>,
}

impl EnableStateMachine {
    pub fn new(max_reconnect_count: i64, storage: Arc<StorageSet>) -> Self {
        Self {
            state: RwLock::new(SessionState::Offline),
            reconnect_count: AtomicU32::new(0),
            max_reconnect_count,
            wait_enable: Notify::new(),
            counters: Counters::default(),
            stat_only: Counters::default(),
            storage,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == SessionState::Enabled
    }

    /// Blocks until the sub-cluster reaches `ENABLED`. Unblocks strictly
    /// after the transition completes (spec.md §5 ordering guarantee).
    pub async fn wait_for_enable(&self) {
        loop {
            if self.is_enabled() {
                return;
            }
            let notified = self.wait_enable.notified();
            if self.is_enabled() {
                return;
            }
            notified.await;
        }
    }

    pub fn begin_connecting(&self) {
        *self.state.write() = SessionState::Connecting;
    }

    /// Transport came up; caller emits `enable` iff this returns `true`.
    pub fn on_transport_up(&self, should_enable: bool) -> bool {
        *self.state.write() = SessionState::Connected;
        if should_enable {
            *self.state.write() = SessionState::Enabling;
        }
        should_enable
    }

    pub async fn on_enable_ack(&self, ack: EnableAck) -> Result<(), SessionError> {
        match ack.error {
            None if ack.ok => {
                *self.state.write() = SessionState::Enabled;
                self.reconnect_count.store(0, Ordering::SeqCst);
                self.wait_enable.notify_waiters();
                Ok(())
            }
            Some(err) => {
                if let Some((expected, _got)) = parse_hash_mismatch(&err.message) {
                    if let Err(e) = self.storage.remove_everywhere(&expected).await {
                        tracing::warn!(hash = %expected, error = %e, "failed to evict mismatched hash after enable-ack");
                    }
                }
                *self.state.write() = SessionState::Connected;
                Err(SessionError::Handshake(err.message))
            }
            None => {
                *self.state.write() = SessionState::Connected;
                Err(SessionError::Protocol(
                    "enable ack reported false without an error".into(),
                ))
            }
        }
    }

    /// Snapshot `{hits, bytes}` for an outgoing keep-alive frame.
    pub fn snapshot_counters(&self) -> (u64, u64) {
        self.counters.snapshot()
    }

    /// Drain exactly the counters captured in `snapshot_counters` after a
    /// successful ack. Concurrent hits recorded since the snapshot remain.
    pub fn confirm_counters(&self, hits: u64, bytes: u64) {
        self.counters.subtract(hits, bytes);
    }

    pub fn record_hit(&self, bytes: u64, count_for_keepalive: bool) {
        self.stat_only.add(1, bytes);
        if count_for_keepalive {
            self.counters.add(1, bytes);
        }
    }

    pub fn stat_only_counters(&self) -> (u64, u64) {
        self.stat_only.snapshot()
    }

    /// `Ok(false)` if the node was kicked and must exit.
    pub fn on_keep_alive_ack(&self, ack: KeepAliveAck) -> Result<bool, SessionError> {
        if let Some(err) = ack.error {
            return Err(SessionError::Protocol(err.message));
        }
        if !ack.keep_going {
            return Ok(false);
        }
        Ok(true)
    }

    /// Three consecutive keep-alive deadline misses force a full
    /// reconnect+re-enable cycle.
    pub fn on_keep_alive_timeout_exceeded(&self) {
        *self.state.write() = SessionState::Offline;
    }

    pub fn begin_disable(&self) {
        *self.state.write() = SessionState::Disabling;
    }

    pub fn on_disable_ack(&self, _ack: DisableAck) {
        *self.state.write() = SessionState::Offline;
    }

    pub fn on_disable_timeout(&self) {
        *self.state.write() = SessionState::Offline;
    }

    pub fn on_transport_down(&self) {
        *self.state.write() = SessionState::Offline;
    }

    /// Returns the new attempt count, or an error if retries are exhausted
    /// per `maxReconnectCount` semantics (spec.md §4.5).
    pub fn next_reconnect_attempt(&self) -> Result<u32, SessionError> {
        if self.max_reconnect_count == 0 {
            return Err(SessionError::ReconnectExhausted);
        }
        let attempt = self.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_reconnect_count > 0 && attempt as i64 > self.max_reconnect_count {
            return Err(SessionError::ReconnectExhausted);
        }
        Ok(attempt)
    }
}
