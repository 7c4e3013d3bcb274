//! Shared relay context handed to every session.

use super::connection::ConnectionId;
use super::registry::ConnectionRegistry;
use super::supervisor::{ReconnectOutcome, ReconnectSupervisor};
use crate::auth::AuthGate;
use crate::shutdown::{Shutdown, ShutdownReason};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Everything a session needs: the registry, the auth gate, the
/// reconnection supervisor and the shutdown coordinator.
pub struct RelayContext {
    registry: ConnectionRegistry,
    auth: AuthGate,
    supervisor: ReconnectSupervisor,
    shutdown: Shutdown,
    next_conn_id: AtomicU64,
}

impl RelayContext {
    pub fn new(registry: ConnectionRegistry, auth: AuthGate, supervisor: ReconnectSupervisor) -> Arc<Self> {
        Arc::new(Self {
            registry,
            auth,
            supervisor,
            shutdown: Shutdown::new(),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stop accepting work, then cancel every task.
    ///
    /// The registry is marked closing first so that upstream sessions ending
    /// during teardown do not start a reconnection.
    pub async fn request_shutdown(&self, reason: ShutdownReason) {
        self.registry.mark_closing().await;
        self.shutdown.trigger(reason);
    }

    /// Start the reconnection supervisor as a tracked background task.
    pub fn start_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_shutting_down() {
            return;
        }
        info!("lost connection to Steam, reconnecting...");
        let ctx = Arc::clone(self);
        self.shutdown.spawn(async move {
            let cancel = ctx.shutdown.token();
            let outcome = ctx.supervisor.run(&ctx.registry, &cancel).await;
            if let ReconnectOutcome::Failed(e) = &outcome {
                error!(error = %e, "reconnection failed");
            }
            if outcome.is_fatal() {
                ctx.request_shutdown(ShutdownReason::UpstreamLost).await;
            }
        });
    }
}
