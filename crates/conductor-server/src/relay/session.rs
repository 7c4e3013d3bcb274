//! Per-connection protocol state machine.
//!
//! Every accepted WebSocket gets a [`RelaySession`]. A connection starts out
//! anonymous: it becomes the upstream by sending `init:<secret>` and is
//! otherwise treated as a client whose frames are commands.

use super::connection::ConnectionHandle;
use super::context::RelayContext;
use super::registry::HandshakeOutcome;
use super::translator::PendingRequest;
use crate::shutdown::ShutdownReason;
use conductor_core::messages::MESSAGE_ID;
use conductor_core::{CommandMessage, Failure, Inbound, Rejection, UpstreamCommand, UpstreamReply};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct RelaySession {
    ctx: Arc<RelayContext>,
    conn: ConnectionHandle,
}

impl RelaySession {
    pub fn new(ctx: Arc<RelayContext>, conn: ConnectionHandle) -> Self {
        Self { ctx, conn }
    }

    #[cfg(test)]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// Dispatch one inbound text frame.
    pub async fn handle_message(&self, text: &str) {
        let inbound = Inbound::decode(text);
        if let Inbound::Handshake(secret) = &inbound {
            self.handle_handshake(secret).await;
            return;
        }

        if self.ctx.registry().is_upstream(self.conn.id()).await {
            self.handle_upstream(inbound).await;
        } else {
            self.handle_downstream(inbound).await;
        }
    }

    /// The connection closed. Starts a reconnection if it was the upstream.
    pub async fn close(self) {
        debug!(conn = self.conn.id(), remote = %self.conn.remote(), "connection closed");
        if self.ctx.registry().upstream_lost(self.conn.id()).await {
            self.ctx.start_reconnect();
        }
    }

    async fn handle_handshake(&self, secret: &str) {
        let remote = self.conn.remote();
        match self.ctx.registry().claim_upstream(&self.conn, secret).await {
            HandshakeOutcome::ColdStart => info!(%remote, "conductor initialized"),
            HandshakeOutcome::Recovered => info!(%remote, "reconnected to Steam"),
            HandshakeOutcome::Replay => error!(%remote, "replay attack blocked, upstream already connected"),
            HandshakeOutcome::BadSecret => error!(%remote, "received bad init message"),
            HandshakeOutcome::Closing => debug!(%remote, "ignoring init message while shutting down"),
        }
    }

    async fn handle_upstream(&self, inbound: Inbound) {
        let map = match inbound {
            Inbound::Object(map) => map,
            Inbound::Terminate => {
                info!("Steam requested termination");
                self.ctx.request_shutdown(ShutdownReason::Terminated).await;
                return;
            }
            Inbound::NotObject | Inbound::NotJson | Inbound::Handshake(_) => {
                error!("received malformed message from Steam");
                return;
            }
        };

        let reply = match UpstreamReply::from_object(map) {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "dropping reply from Steam");
                return;
            }
        };

        let id = reply.message_id;
        let Some(pending) = self.ctx.registry().take_pending(id).await else {
            debug!(id, "no pending request for reply");
            return;
        };
        let Some(client) = pending.downstream.upgrade() else {
            warn!(id, conn = pending.downstream.id(), "client disconnected before Steam replied");
            return;
        };

        match reply.into_downstream(pending.requester_id) {
            Ok(text) => {
                if client.send(text).is_err() {
                    warn!(id, conn = client.id(), "client disconnected before reply was sent");
                }
            }
            Err(e) => error!(id, error = %e, "failed to encode reply"),
        }
    }

    async fn handle_downstream(&self, inbound: Inbound) {
        let map = match inbound {
            Inbound::Object(map) => map,
            Inbound::NotObject => return self.reject(Rejection::InvalidMessage, None),
            Inbound::NotJson | Inbound::Terminate | Inbound::Handshake(_) => {
                return self.reject(Rejection::NotJson, None)
            }
        };

        let requester_id = requester_id(&map);
        let cmd = match CommandMessage::from_object(map) {
            Ok(cmd) => cmd,
            Err(rejection) => {
                debug!(conn = self.conn.id(), %rejection, "rejected client message");
                return self.reject(rejection, requester_id);
            }
        };

        if let Err(rejection) = self.ctx.auth().authorize(cmd.secret.as_ref()) {
            warn!(remote = %self.conn.remote(), command = %cmd.command, %rejection, "unauthorized command");
            return self.reject(rejection, requester_id);
        }

        let registry = self.ctx.registry();
        let admission = match registry.admit(&self.conn, requester_id.clone()).await {
            Ok(admission) => admission,
            Err(rejection) => {
                warn!(command = %cmd.command, %rejection, "command not forwarded");
                return self.reject(rejection, requester_id);
            }
        };

        if let Some(evicted) = admission.evicted {
            notify_evicted(evicted);
        }

        let id = admission.internal_id;
        let forwarded = UpstreamCommand::new(id, &admission.secret, &cmd)
            .to_json()
            .and_then(|json| admission.upstream.send(json));

        match forwarded {
            Ok(()) => debug!(id, command = %cmd.command, "forwarded command to Steam"),
            Err(e) => {
                warn!(id, error = %e, "failed to forward command to Steam");
                registry.take_pending(id).await;
                self.reject(Rejection::NotConnected, requester_id);
            }
        }
    }

    fn reject(&self, rejection: Rejection, message_id: Option<Value>) {
        send_failure(&self.conn, rejection, message_id);
    }
}

/// The caller's `messageId`, if it supplied a usable one.
fn requester_id(map: &Map<String, Value>) -> Option<Value> {
    map.get(MESSAGE_ID).filter(|v| !v.is_null()).cloned()
}

fn notify_evicted(evicted: PendingRequest) {
    warn!(id = evicted.internal_id, "request overwritten before Steam replied");
    if let Some(client) = evicted.downstream.upgrade() {
        send_failure(&client, Rejection::Evicted, evicted.requester_id);
    }
}

fn send_failure(conn: &ConnectionHandle, rejection: Rejection, message_id: Option<Value>) {
    match Failure::new(rejection, message_id).to_json() {
        Ok(text) => {
            if conn.send(text).is_err() {
                debug!(conn = conn.id(), "client gone before rejection was sent");
            }
        }
        Err(e) => error!(error = %e, "failed to encode rejection"),
    }
}
