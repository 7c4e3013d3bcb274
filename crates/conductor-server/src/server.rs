//! Relay server: accepts WebSocket connections and runs a session per
//! connection until shutdown.

use crate::relay::{ConnectionHandle, RelayContext, RelaySession};
use crate::transport::websocket::{self, WebSocketConnection};
use conductor_core::{ConductorError, ConductorResult, Rejection};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// The relay's listening socket plus the shared context.
pub struct RelayServer {
    ctx: Arc<RelayContext>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RelayServer {
    /// Bind the listener on `addr` (`host:port`).
    pub async fn bind(ctx: Arc<RelayContext>, addr: &str) -> ConductorResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ConductorError::Transport(format!("WS bind on {addr} failed: {e}")))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            ctx,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown is requested.
    pub async fn run(self) {
        let token = self.ctx.shutdown().token();
        let mut ws_rx = websocket::start_listener(self.listener, token.clone());
        info!(addr = %self.local_addr, "conductor listening");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                conn = ws_rx.recv() => match conn {
                    Some(conn) => {
                        let ctx = Arc::clone(&self.ctx);
                        self.ctx.shutdown().spawn(handle_connection(ctx, conn));
                    }
                    None => break,
                },
            }
        }

        debug!("accept loop stopped");
    }
}

/// Pump one connection: inbound frames go to the session, queued outbound
/// frames go to the socket.
async fn handle_connection(ctx: Arc<RelayContext>, mut conn: WebSocketConnection) {
    let (handle, mut outbound) = ConnectionHandle::new(ctx.next_connection_id(), conn.remote_addr);
    debug!(conn = handle.id(), remote = %conn.remote_addr, "session started");
    let session = RelaySession::new(Arc::clone(&ctx), handle);
    let token = ctx.shutdown().token();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                websocket::ws_close(&mut conn.ws_stream, &Rejection::ShuttingDown.to_string()).await;
                break;
            }

            Some(text) = outbound.recv() => {
                if let Err(e) = websocket::ws_send_text(&mut conn.ws_stream, text).await {
                    debug!(error = %e, "WebSocket session ended");
                    break;
                }
            }

            frame = websocket::ws_recv_text(&mut conn.ws_stream) => match frame {
                Ok(Some(text)) => session.handle_message(&text).await,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "WebSocket session ended");
                    break;
                }
            },
        }
    }

    session.close().await;
}
