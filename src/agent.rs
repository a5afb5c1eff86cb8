//! Top-level per-sub-cluster driver: connect → authenticate → enable →
//! keep-alive → disable (spec.md §4.5, §4.6), deciding reconnect vs. exit.
//!
//! Per spec.md §7, "the sub-cluster state machine is the error locus":
//! downstream components ([`crate::session::controller::SessionController`],
//! [`crate::manifest_sync::ManifestSync`]) surface typed errors; this is
//! the one place that turns them into a retry, a state transition, or a
//! terminal [`AgentError`] that the process driver (`main.rs`) maps to an
//! exit code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::SplitStream;
use futures::StreamExt;
use tokio::sync::watch;

use crate::auth::AuthTokenCache;
use crate::coalescer::DownloadCoalescer;
use crate::error::{AgentError, AgentResult};
use crate::identity::ClusterIdentity;
use crate::manifest_sync::ManifestSync;
use crate::session::controller::{SessionController, WsSink, WsStream};
use crate::session::protocol::{ControlEvent, EnableRequest, Flavor, KeepAliveRequest};
use crate::session::state_machine::EnableStateMachine;
use crate::session::SessionError;
use crate::stats::StatsAggregator;
use crate::storage::StorageSet;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
const ENABLE_ACK_TIMEOUT: Duration = Duration::from_secs(360);
const MAX_KEEP_ALIVE_MISSES: u32 = 3;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Why a connection attempt ended, decided inside [`SubClusterAgent::drive_session`].
enum SessionOutcome {
    /// The coordinator kicked this node (`keep-alive-ack{false}`): terminal.
    Kicked,
    /// `disable()` completed cleanly — the driver is shutting down.
    CleanDisable,
    /// Transport dropped, or the enable/keep-alive protocol broke down;
    /// the caller decides whether to reconnect.
    Disconnected,
}

/// Everything one sub-cluster (tenant) needs to run its own
/// connect/enable/keep-alive/disable lifecycle independent of every other
/// configured sub-cluster.
pub struct SubClusterAgent {
    pub identity: Arc<ClusterIdentity>,
    pub auth: Arc<AuthTokenCache>,
    pub storage: Arc<StorageSet>,
    pub coalescer: Arc<DownloadCoalescer>,
    pub manifest: Arc<ManifestSync>,
    pub state_machine: Arc<EnableStateMachine>,
    pub stats: Arc<StatsAggregator>,
    controller: SessionController,
    version: String,
    byoc: bool,
    no_fast_enable: bool,
    disable_ack_timeout: Duration,
}

impl SubClusterAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<ClusterIdentity>,
        control_url: impl Into<String>,
        auth: Arc<AuthTokenCache>,
        storage: Arc<StorageSet>,
        coalescer: Arc<DownloadCoalescer>,
        manifest: Arc<ManifestSync>,
        state_machine: Arc<EnableStateMachine>,
        stats: Arc<StatsAggregator>,
        version: impl Into<String>,
        byoc: bool,
        no_fast_enable: bool,
        disable_ack_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            auth,
            storage,
            coalescer,
            manifest,
            state_machine,
            stats,
            controller: SessionController::new(control_url),
            version: version.into(),
            byoc,
            no_fast_enable,
            disable_ack_timeout,
        }
    }

    /// Run the connect/enable/keep-alive/disable loop until `shutdown`
    /// fires or a terminal condition is reached (kicked, or the reconnect
    /// budget from `should_enable`'s owner is exhausted).
    pub async fn run(
        self: Arc<Self>,
        should_enable: Arc<AtomicBool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> AgentResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            self.state_machine.begin_connecting();
            let token = match self.auth.get_token().await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(cluster = %self.identity.id, error = %e, "failed to obtain auth token");
                    return Err(AgentError::Auth(e));
                }
            };

            let stream = match self.controller.connect(&token.jwt).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(cluster = %self.identity.id, error = %e, "control channel connect failed");
                    self.state_machine.on_transport_down();
                    if self.reconnect_or_bail(&should_enable)?.is_none() {
                        return Ok(());
                    }
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };

            let (mut sink, mut ws_stream) = stream.split();
            let want_enable = should_enable.load(Ordering::SeqCst);
            if self.state_machine.on_transport_up(want_enable) {
                if let Err(e) = self.send_enable(&mut sink).await {
                    tracing::warn!(cluster = %self.identity.id, error = %e, "failed to send enable request");
                }
            }

            let outcome = self
                .drive_session(&mut sink, &mut ws_stream, want_enable, &mut shutdown)
                .await?;

            match outcome {
                SessionOutcome::Kicked => return Err(AgentError::Kicked),
                SessionOutcome::CleanDisable => return Ok(()),
                SessionOutcome::Disconnected => {
                    self.state_machine.on_transport_down();
                    if self.reconnect_or_bail(&should_enable)?.is_none() {
                        return Ok(());
                    }
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    /// Increment the reconnect counter; `Ok(None)` means "stop trying but
    /// don't treat it as an error" (the owner no longer wants to be
    /// enabled), `Err` means the reconnect budget is exhausted.
    fn reconnect_or_bail(
        &self,
        should_enable: &AtomicBool,
    ) -> AgentResult<Option<u32>> {
        if !should_enable.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match self.state_machine.next_reconnect_attempt() {
            Ok(attempt) => {
                tracing::warn!(cluster = %self.identity.id, attempt, "reconnecting to coordinator");
                Ok(Some(attempt))
            }
            Err(e) => Err(AgentError::Session(e)),
        }
    }

    async fn send_enable(&self, sink: &mut WsSink) -> Result<(), SessionError> {
        let request = EnableRequest {
            host: self.identity.host.clone(),
            port: self.identity.public_port,
            version: self.version.clone(),
            byoc: self.byoc,
            no_fast_enable: self.no_fast_enable,
            flavor: Flavor {
                runtime: "rust".to_string(),
                storage: self.storage.flavor(),
            },
        };
        SessionController::send_event(sink, "enable", request).await
    }

    async fn send_keep_alive(&self, sink: &mut WsSink, hits: u64, bytes: u64) -> Result<(), SessionError> {
        let request = KeepAliveRequest {
            time: chrono::Utc::now(),
            hits,
            bytes,
        };
        SessionController::send_event(sink, "keep-alive", request).await
    }

    async fn send_disable(&self, sink: &mut WsSink) -> Result<(), SessionError> {
        SessionController::send_event(sink, "disable", ()).await
    }

    /// Drive one live connection: wait for the enable ack (if one was
    /// requested), then alternate between the keep-alive ticker and
    /// inbound control-channel frames until disconnect, kick, or a
    /// requested clean disable.
    async fn drive_session(
        &self,
        sink: &mut WsSink,
        stream: &mut SplitStream<WsStream>,
        want_enable: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AgentResult<SessionOutcome> {
        let mut enable_deadline = want_enable.then(|| Instant::now() + ENABLE_ACK_TIMEOUT);
        let mut keep_alive_misses: u32 = 0;
        let mut pending_keep_alive: Option<(Instant, u64, u64)> = None;
        let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if self.state_machine.is_enabled() {
                            self.state_machine.begin_disable();
                            if self.send_disable(sink).await.is_ok() {
                                // Best-effort: give the coordinator a moment to ack,
                                // but don't block shutdown indefinitely on it.
                                let deadline = tokio::time::sleep(self.disable_ack_timeout);
                                tokio::pin!(deadline);
                                tokio::select! {
                                    _ = &mut deadline => {}
                                    frame = stream.next() => {
                                        if let Some(Ok(msg)) = frame {
                                            if let Ok(Some(ControlEvent::DisableAck(ack))) =
                                                SessionController::decode_event(&msg)
                                            {
                                                self.state_machine.on_disable_ack(ack);
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        return Ok(SessionOutcome::CleanDisable);
                    }
                }

                _ = ticker.tick(), if self.state_machine.is_enabled() && pending_keep_alive.is_none() => {
                    let (hits, bytes) = self.state_machine.snapshot_counters();
                    if self.send_keep_alive(sink, hits, bytes).await.is_err() {
                        return Ok(SessionOutcome::Disconnected);
                    }
                    pending_keep_alive = Some((Instant::now() + KEEP_ALIVE_INTERVAL / 2, hits, bytes));
                }

                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    if let Some((deadline, hits, bytes)) = pending_keep_alive {
                        if Instant::now() >= deadline {
                            keep_alive_misses += 1;
                            pending_keep_alive = None;
                            tracing::warn!(
                                cluster = %self.identity.id,
                                misses = keep_alive_misses,
                                "keep-alive ack deadline missed",
                            );
                            let _ = (hits, bytes);
                            if keep_alive_misses >= MAX_KEEP_ALIVE_MISSES {
                                self.state_machine.on_keep_alive_timeout_exceeded();
                                return Ok(SessionOutcome::Disconnected);
                            }
                        }
                    }
                    if let Some(deadline) = enable_deadline {
                        if Instant::now() >= deadline {
                            tracing::warn!(cluster = %self.identity.id, "enable ack timed out");
                            return Ok(SessionOutcome::Disconnected);
                        }
                    }
                }

                frame = stream.next() => {
                    let Some(frame) = frame else {
                        return Ok(SessionOutcome::Disconnected);
                    };
                    let msg = match frame {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(cluster = %self.identity.id, error = %e, "transport error");
                            return Ok(SessionOutcome::Disconnected);
                        }
                    };
                    let event = match SessionController::decode_event(&msg) {
                        Ok(Some(event)) => event,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!(cluster = %self.identity.id, error = %e, "malformed control frame");
                            return Ok(SessionOutcome::Disconnected);
                        }
                    };

                    match event {
                        ControlEvent::EnableAck(ack) => {
                            enable_deadline = None;
                            if let Err(e) = self.state_machine.on_enable_ack(ack).await {
                                tracing::warn!(cluster = %self.identity.id, error = %e, "enable rejected by coordinator");
                                return Ok(SessionOutcome::Disconnected);
                            }
                            tracing::info!(cluster = %self.identity.id, "sub-cluster enabled");
                        }
                        ControlEvent::KeepAliveAck(ack) => {
                            let captured = pending_keep_alive.take();
                            match self.state_machine.on_keep_alive_ack(ack) {
                                Ok(true) => {
                                    keep_alive_misses = 0;
                                    if let Some((_, hits, bytes)) = captured {
                                        self.state_machine.confirm_counters(hits, bytes);
                                    }
                                }
                                Ok(false) => return Ok(SessionOutcome::Kicked),
                                Err(e) => {
                                    tracing::warn!(cluster = %self.identity.id, error = %e, "malformed keep-alive ack");
                                    return Ok(SessionOutcome::Disconnected);
                                }
                            }
                        }
                        ControlEvent::DisableAck(ack) => {
                            self.state_machine.on_disable_ack(ack);
                            return Ok(SessionOutcome::CleanDisable);
                        }
                        ControlEvent::RequestCertAck(ack) => {
                            if let Some(err) = ack.error {
                                tracing::warn!(cluster = %self.identity.id, error = %err.message, "request-cert failed");
                            } else if ack.cert.is_some() {
                                tracing::info!(cluster = %self.identity.id, "received coordinator-issued certificate (TLS termination delegated to host)");
                            }
                        }
                        ControlEvent::Message(message) => {
                            tracing::info!(cluster = %self.identity.id, %message, "operator message");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsAggregator;
    use crate::storage::local::LocalStorage;
    use crate::storage::set::StorageEntry;

    fn identity() -> ClusterIdentity {
        ClusterIdentity {
            id: "node-1".into(),
            secret: "s3cr3t".into(),
            host: "127.0.0.1".into(),
            public_port: 8080,
            public_hosts: vec!["cdn.example".into()],
            byoc: false,
            prefix: "http://127.0.0.1:0".into(),
        }
    }

    async fn agent(max_reconnect_count: i64) -> SubClusterAgent {
        let http = reqwest::Client::new();
        let identity = Arc::new(identity());
        let auth = Arc::new(AuthTokenCache::new(http.clone(), &identity));
        let mut dir = std::env::temp_dir();
        dir.push(format!("edgecache-agent-test-{}", uuid::Uuid::new_v4()));
        let backend = LocalStorage::new(dir).await.unwrap();
        let storage = Arc::new(StorageSet::new(vec![StorageEntry {
            id: "a".into(),
            weight: 1,
            backend: Arc::new(backend),
        }]));
        let coalescer = Arc::new(DownloadCoalescer::new(
            http.clone(),
            "http://127.0.0.1:9",
            Arc::clone(&auth),
            Arc::clone(&storage),
        ));
        let cache: Arc<dyn crate::cache::ResponseCache> = Arc::new(crate::cache::MemoryCache::new());
        let manifest = Arc::new(ManifestSync::new(
            http.clone(),
            "http://127.0.0.1:9",
            Arc::clone(&auth),
            Arc::clone(&storage),
            Arc::clone(&coalescer),
            cache,
            "node-1",
            4,
        ));
        let state_machine = Arc::new(EnableStateMachine::new(max_reconnect_count, Arc::clone(&storage)));
        let mut stats_dir = std::env::temp_dir();
        stats_dir.push(format!("edgecache-agent-stats-{}", uuid::Uuid::new_v4()));
        let stats = Arc::new(StatsAggregator::new(stats_dir));
        SubClusterAgent::new(
            identity,
            "ws://127.0.0.1:0",
            auth,
            storage,
            coalescer,
            manifest,
            state_machine,
            stats,
            "test",
            false,
            false,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn reconnect_or_bail_stops_without_error_when_no_longer_wanted() {
        let agent = agent(-1).await;
        let should_enable = AtomicBool::new(false);
        assert!(agent.reconnect_or_bail(&should_enable).unwrap().is_none());
    }

    #[tokio::test]
    async fn reconnect_or_bail_surfaces_session_error_when_budget_exhausted() {
        let agent = agent(0).await;
        let should_enable = AtomicBool::new(true);
        let err = agent.reconnect_or_bail(&should_enable).unwrap_err();
        assert!(matches!(err, AgentError::Session(SessionError::ReconnectExhausted)));
    }

    #[tokio::test]
    async fn reconnect_or_bail_counts_attempts_when_retrying_forever() {
        let agent = agent(-1).await;
        let should_enable = AtomicBool::new(true);
        assert_eq!(agent.reconnect_or_bail(&should_enable).unwrap(), Some(1));
        assert_eq!(agent.reconnect_or_bail(&should_enable).unwrap(), Some(2));
    }
}
