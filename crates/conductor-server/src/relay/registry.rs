//! Connection registry.
//!
//! Tracks the single upstream connection, the handshake secret it must
//! present, the relay's lifecycle mode, and (through the [`IdTranslator`])
//! every request awaiting an upstream reply.
//!
//! Each loss of the upstream opens a new reconnection cycle. A handshake
//! during a cycle is accepted only with the secret rotated for that cycle.
//!
//! Sessions run on a multi-threaded runtime, so every read-modify-write of
//! this state happens under one mutex. No await happens while it is held;
//! frames are pushed into unbounded per-connection queues after the lock is
//! released.

use super::connection::{ConnectionHandle, ConnectionId};
use super::translator::{IdTranslator, PendingRequest, MAX_MESSAGE_ID};
use conductor_core::Rejection;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Lifecycle mode of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Serving (or waiting for the first upstream).
    Normal,
    /// The upstream dropped; a supervisor is re-injecting the payload.
    Reconnecting,
    /// Shutting down; no new work is accepted.
    Closing,
}

/// Result of an `init:` handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// First upstream since startup.
    ColdStart,
    /// Upstream re-established after a loss.
    Recovered,
    /// Valid secret, but an upstream is already registered.
    Replay,
    /// Wrong secret.
    BadSecret,
    /// The relay is shutting down.
    Closing,
}

/// Where a running supervisor stands, as seen from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectProgress {
    /// Still waiting for an upstream in the supervisor's cycle.
    Pending,
    /// The relay recovered and lost the upstream again: a newer cycle began.
    Restarted,
    /// The relay left `Reconnecting`; the single-flight guard is released.
    Settled(RelayMode),
}

/// A command admitted for forwarding.
#[derive(Debug)]
pub struct Admission {
    pub internal_id: u32,
    pub upstream: ConnectionHandle,
    /// Handshake secret to stamp on the forwarded command.
    pub secret: String,
    /// Entry overwritten by ID wraparound, if any.
    pub evicted: Option<PendingRequest>,
}

#[derive(Debug)]
struct RegistryState {
    upstream: Option<ConnectionHandle>,
    translator: IdTranslator,
    mode: RelayMode,
    secret: String,
    /// Reconnection cycle, bumped on every Normal to Reconnecting move.
    cycle: u64,
    /// Cycle the current secret was rotated for.
    secret_cycle: u64,
    supervisor_running: bool,
}

impl RegistryState {
    fn set_upstream(&mut self, handle: ConnectionHandle) {
        self.upstream = Some(handle);
    }

    fn clear_upstream(&mut self) -> Option<ConnectionHandle> {
        self.upstream.take()
    }

    fn current_upstream(&self) -> Option<&ConnectionHandle> {
        self.upstream.as_ref()
    }
}

/// Process-wide registry shared by all sessions.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    mode_tx: watch::Sender<RelayMode>,
    cycle_tx: watch::Sender<u64>,
}

impl ConnectionRegistry {
    /// Create a registry expecting `secret` from the first upstream.
    pub fn new(secret: String) -> Self {
        Self::with_window(secret, MAX_MESSAGE_ID)
    }

    /// Create a registry with a custom internal ID window.
    pub fn with_window(secret: String, window: u32) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                upstream: None,
                translator: IdTranslator::new(window),
                mode: RelayMode::Normal,
                secret,
                cycle: 0,
                secret_cycle: 0,
                supervisor_running: false,
            }),
            mode_tx: watch::channel(RelayMode::Normal).0,
            cycle_tx: watch::channel(0).0,
        }
    }

    fn set_mode(&self, state: &mut RegistryState, mode: RelayMode) {
        state.mode = mode;
        self.mode_tx.send_replace(mode);
    }

    /// Try to register `conn` as the upstream using the secret it presented.
    pub async fn claim_upstream(&self, conn: &ConnectionHandle, presented: &str) -> HandshakeOutcome {
        let mut state = self.state.lock().await;

        if state.mode == RelayMode::Closing {
            return HandshakeOutcome::Closing;
        }
        let reconnecting = state.mode == RelayMode::Reconnecting;
        if presented != state.secret || (reconnecting && state.secret_cycle != state.cycle) {
            return HandshakeOutcome::BadSecret;
        }
        if state.current_upstream().is_some() && !reconnecting {
            return HandshakeOutcome::Replay;
        }

        state.set_upstream(conn.clone());
        debug!(conn = conn.id(), "upstream registered");
        if reconnecting {
            self.set_mode(&mut state, RelayMode::Normal);
            HandshakeOutcome::Recovered
        } else {
            HandshakeOutcome::ColdStart
        }
    }

    /// Allocate an internal ID for a downstream command and record it as
    /// pending.
    pub async fn admit(
        &self,
        downstream: &ConnectionHandle,
        requester_id: Option<Value>,
    ) -> Result<Admission, Rejection> {
        let mut state = self.state.lock().await;

        if state.mode == RelayMode::Closing {
            return Err(Rejection::ShuttingDown);
        }
        let upstream = state
            .current_upstream()
            .cloned()
            .ok_or(Rejection::NotConnected)?;

        let internal_id = state.translator.next_id();
        let evicted =
            state
                .translator
                .register_pending(internal_id, downstream.downgrade(), requester_id);

        Ok(Admission {
            internal_id,
            upstream,
            secret: state.secret.clone(),
            evicted,
        })
    }

    /// Remove and return the pending request for an upstream reply.
    pub async fn take_pending(&self, internal_id: u32) -> Option<PendingRequest> {
        self.state.lock().await.translator.take_pending(internal_id)
    }

    #[cfg(test)]
    pub async fn is_pending(&self, internal_id: u32) -> bool {
        self.state.lock().await.translator.is_pending(internal_id)
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.translator.pending_count()
    }

    /// Whether `id` is the registered upstream.
    pub async fn is_upstream(&self, id: ConnectionId) -> bool {
        self.state
            .lock()
            .await
            .current_upstream()
            .is_some_and(|u| u.id() == id)
    }

    #[cfg(test)]
    pub async fn current_upstream(&self) -> Option<ConnectionHandle> {
        self.state.lock().await.current_upstream().cloned()
    }

    /// Handle the close of connection `id`.
    ///
    /// Losing the upstream while serving normally opens a new reconnection
    /// cycle. Returns `true` when no supervisor is running; the caller must
    /// then start one. A running supervisor picks the new cycle up itself.
    pub async fn upstream_lost(&self, id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;

        if !state.current_upstream().is_some_and(|u| u.id() == id) {
            return false;
        }
        state.clear_upstream();
        debug!(conn = id, "upstream cleared");

        if state.mode != RelayMode::Normal {
            return false;
        }
        self.set_mode(&mut state, RelayMode::Reconnecting);
        state.cycle += 1;
        self.cycle_tx.send_replace(state.cycle);
        if state.supervisor_running {
            return false;
        }
        state.supervisor_running = true;
        true
    }

    /// Called by the supervisor between attempts, with the cycle it is
    /// working on.
    pub async fn reconnect_progress(&self, cycle: u64) -> ReconnectProgress {
        let mut state = self.state.lock().await;
        if state.mode != RelayMode::Reconnecting {
            state.supervisor_running = false;
            return ReconnectProgress::Settled(state.mode);
        }
        if state.cycle != cycle {
            return ReconnectProgress::Restarted;
        }
        ReconnectProgress::Pending
    }

    /// Install the handshake secret for the current reconnection cycle and
    /// return that cycle.
    pub async fn rotate_secret(&self, secret: String) -> u64 {
        let mut state = self.state.lock().await;
        state.secret = secret;
        state.secret_cycle = state.cycle;
        state.cycle
    }

    #[cfg(test)]
    pub async fn secret(&self) -> String {
        self.state.lock().await.secret.clone()
    }

    /// Stop accepting new work.
    pub async fn mark_closing(&self) {
        let mut state = self.state.lock().await;
        state.supervisor_running = false;
        self.set_mode(&mut state, RelayMode::Closing);
    }

    #[cfg(test)]
    pub fn mode(&self) -> RelayMode {
        *self.mode_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RelayMode> {
        self.mode_tx.subscribe()
    }

    /// Wait up to `timeout` for the relay to leave `Reconnecting`.
    pub async fn wait_until_settled(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|m| *m != RelayMode::Reconnecting))
            .await
            .is_ok_and(|r| r.is_ok());
        settled
    }

    /// Resolve once a reconnection cycle newer than `cycle` has begun.
    pub async fn wait_for_new_cycle(&self, cycle: u64) {
        let mut rx = self.cycle_tx.subscribe();
        let _ = rx.wait_for(|c| *c != cycle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn conn(id: ConnectionId) -> (ConnectionHandle, UnboundedReceiver<String>) {
        ConnectionHandle::new(id, "127.0.0.1:5000".parse().unwrap())
    }

    #[tokio::test]
    async fn cold_start_then_replay_is_blocked() {
        let reg = ConnectionRegistry::new("s3cret".into());
        let (up, _r1) = conn(1);
        let (imposter, _r2) = conn(2);

        assert_eq!(reg.claim_upstream(&up, "s3cret").await, HandshakeOutcome::ColdStart);
        assert_eq!(reg.claim_upstream(&imposter, "s3cret").await, HandshakeOutcome::Replay);
        assert!(reg.is_upstream(1).await);
        assert!(!reg.is_upstream(2).await);
    }

    #[tokio::test]
    async fn bad_secret_is_not_registered() {
        let reg = ConnectionRegistry::new("s3cret".into());
        let (c, _r) = conn(1);
        assert_eq!(reg.claim_upstream(&c, "guess").await, HandshakeOutcome::BadSecret);
        assert!(reg.current_upstream().await.is_none());
    }

    #[tokio::test]
    async fn admit_requires_upstream() {
        let reg = ConnectionRegistry::new("s".into());
        let (client, _r) = conn(5);
        assert_eq!(
            reg.admit(&client, None).await.unwrap_err(),
            Rejection::NotConnected
        );
    }

    #[tokio::test]
    async fn admit_allocates_unique_pending_ids() {
        let reg = ConnectionRegistry::new("s".into());
        let (up, _r1) = conn(1);
        let (client, _r2) = conn(2);
        reg.claim_upstream(&up, "s").await;

        let a = reg.admit(&client, Some(json!(7))).await.unwrap();
        let b = reg.admit(&client, None).await.unwrap();
        assert_ne!(a.internal_id, b.internal_id);
        assert_eq!(a.secret, "s");
        assert_eq!(a.upstream.id(), 1);
        assert!(reg.is_pending(a.internal_id).await);

        let p = reg.take_pending(a.internal_id).await.unwrap();
        assert_eq!(p.requester_id, Some(json!(7)));
        assert!(!reg.is_pending(a.internal_id).await);
        assert_eq!(reg.pending_count().await, 1);
    }

    #[tokio::test]
    async fn loss_enters_reconnecting_once() {
        let reg = ConnectionRegistry::new("s".into());
        let (up, _r) = conn(1);
        reg.claim_upstream(&up, "s").await;

        assert!(!reg.upstream_lost(99).await);
        assert!(reg.upstream_lost(1).await);
        assert_eq!(reg.mode(), RelayMode::Reconnecting);
        assert!(!reg.upstream_lost(1).await);
        assert!(reg.current_upstream().await.is_none());
        assert_eq!(reg.reconnect_progress(1).await, ReconnectProgress::Pending);
    }

    #[tokio::test]
    async fn reconnect_accepts_rotated_secret() {
        let reg = ConnectionRegistry::new("old".into());
        let (up, _r1) = conn(1);
        reg.claim_upstream(&up, "old").await;
        reg.upstream_lost(1).await;
        let cycle = reg.rotate_secret("new".into()).await;

        let (up2, _r2) = conn(2);
        assert_eq!(reg.claim_upstream(&up2, "old").await, HandshakeOutcome::BadSecret);
        assert_eq!(reg.claim_upstream(&up2, "new").await, HandshakeOutcome::Recovered);
        assert_eq!(reg.mode(), RelayMode::Normal);
        assert_eq!(
            reg.reconnect_progress(cycle).await,
            ReconnectProgress::Settled(RelayMode::Normal)
        );
    }

    #[tokio::test]
    async fn handshake_waits_for_the_cycle_secret() {
        let reg = ConnectionRegistry::new("s".into());
        let (up, _r1) = conn(1);
        reg.claim_upstream(&up, "s").await;
        reg.upstream_lost(1).await;

        // The startup secret is no longer good once the upstream is lost.
        let (up2, _r2) = conn(2);
        assert_eq!(reg.claim_upstream(&up2, "s").await, HandshakeOutcome::BadSecret);
        reg.rotate_secret("s".into()).await;
        assert_eq!(reg.claim_upstream(&up2, "s").await, HandshakeOutcome::Recovered);
    }

    #[tokio::test]
    async fn second_loss_before_supervisor_notices_opens_new_cycle() {
        let reg = ConnectionRegistry::new("s".into());
        let (up, _r1) = conn(1);
        reg.claim_upstream(&up, "s").await;
        assert!(reg.upstream_lost(1).await);
        let first = reg.rotate_secret("a".into()).await;

        // Recovered, then lost again before the supervisor looked.
        let (up2, _r2) = conn(2);
        assert_eq!(reg.claim_upstream(&up2, "a").await, HandshakeOutcome::Recovered);
        assert!(!reg.upstream_lost(2).await);
        assert_eq!(reg.mode(), RelayMode::Reconnecting);
        assert_eq!(reg.reconnect_progress(first).await, ReconnectProgress::Restarted);

        // The first cycle's secret does not complete the second cycle.
        let (up3, _r3) = conn(3);
        assert_eq!(reg.claim_upstream(&up3, "a").await, HandshakeOutcome::BadSecret);

        let second = reg.rotate_secret("b".into()).await;
        assert_ne!(first, second);
        assert_eq!(reg.reconnect_progress(second).await, ReconnectProgress::Pending);
        assert_eq!(reg.claim_upstream(&up3, "b").await, HandshakeOutcome::Recovered);
        assert_eq!(
            reg.reconnect_progress(second).await,
            ReconnectProgress::Settled(RelayMode::Normal)
        );

        // Guard released: the next loss needs a new supervisor.
        assert!(reg.upstream_lost(3).await);
    }

    #[tokio::test]
    async fn new_cycle_wakes_waiters() {
        let reg = std::sync::Arc::new(ConnectionRegistry::new("s".into()));
        let (up, _r1) = conn(1);
        reg.claim_upstream(&up, "s").await;

        let r = reg.clone();
        let waiter = tokio::spawn(async move { r.wait_for_new_cycle(0).await });
        reg.upstream_lost(1).await;
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn closing_rejects_everything() {
        let reg = ConnectionRegistry::new("s".into());
        let (up, _r1) = conn(1);
        let (client, _r2) = conn(2);
        reg.claim_upstream(&up, "s").await;
        reg.mark_closing().await;

        assert_eq!(
            reg.admit(&client, None).await.unwrap_err(),
            Rejection::ShuttingDown
        );
        assert!(!reg.upstream_lost(1).await);
        let (c3, _r3) = conn(3);
        assert_eq!(reg.claim_upstream(&c3, "s").await, HandshakeOutcome::Closing);
    }

    #[tokio::test]
    async fn wait_until_settled_sees_handshake() {
        let reg = std::sync::Arc::new(ConnectionRegistry::new("s".into()));
        let (up, _r1) = conn(1);
        reg.claim_upstream(&up, "s").await;
        reg.upstream_lost(1).await;
        reg.rotate_secret("s".into()).await;

        assert!(!reg.wait_until_settled(Duration::from_millis(10)).await);

        let r = reg.clone();
        let (up2, _r2) = conn(2);
        tokio::spawn(async move {
            r.claim_upstream(&up2, "s").await;
        });
        assert!(reg.wait_until_settled(Duration::from_secs(5)).await);
    }
}
