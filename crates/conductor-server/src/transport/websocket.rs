//! WebSocket listener using tokio-tungstenite.
//!
//! Both the upstream and the clients connect here; the relay tells them
//! apart by what they send, not by how they connect.

use conductor_core::{ConductorError, ConductorResult};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Maximum size of a single text frame (16 MiB).
const MAX_WS_FRAME_SIZE: usize = 16 * 1_048_576;

/// An accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Accept connections on `listener` until `cancel` fires.
///
/// Returns a receiver that yields connections whose WebSocket handshake
/// completed. The channel closes once the listener stops.
pub fn start_listener(
    listener: TcpListener,
    cancel: CancellationToken,
) -> mpsc::Receiver<WebSocketConnection> {
    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    debug!(remote = %addr, "listener stopped, dropping connection");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    rx
}

/// Send a text frame.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> ConductorResult<()> {
    ws.send(Message::Text(text))
        .await
        .map_err(|e| ConductorError::Transport(format!("WS send failed: {e}")))
}

/// Send a close frame with `reason`, ignoring failures.
pub async fn ws_close(ws: &mut WebSocketStream<TcpStream>, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::Away,
        reason: reason.to_string().into(),
    };
    let _ = ws.close(Some(frame)).await;
}

/// Receive the next text frame.
///
/// Returns `None` once the peer closes. Binary frames are accepted when they
/// hold UTF-8; control frames are skipped.
pub async fn ws_recv_text(ws: &mut WebSocketStream<TcpStream>) -> ConductorResult<Option<String>> {
    loop {
        let text = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => String::from_utf8(data).map_err(|_| {
                ConductorError::InvalidMessage("binary frame is not UTF-8".into())
            })?,
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(ConductorError::Transport(format!("WS recv failed: {e}")));
            }
        };
        if text.len() > MAX_WS_FRAME_SIZE {
            return Err(ConductorError::InvalidMessage(format!(
                "WS frame too large: {} bytes (max {MAX_WS_FRAME_SIZE})",
                text.len()
            )));
        }
        return Ok(Some(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    async fn listen() -> (SocketAddr, mpsc::Receiver<WebSocketConnection>, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let rx = start_listener(listener, cancel.clone());
        (addr, rx, cancel)
    }

    #[tokio::test]
    async fn accepts_and_exchanges_text() {
        let (addr, mut rx, _cancel) = listen().await;

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let mut server = rx.recv().await.unwrap();

        client.send(Message::text("init:abc")).await.unwrap();
        assert_eq!(
            ws_recv_text(&mut server.ws_stream).await.unwrap().as_deref(),
            Some("init:abc")
        );

        client.send(Message::Binary(b"{}".to_vec())).await.unwrap();
        assert_eq!(
            ws_recv_text(&mut server.ws_stream).await.unwrap().as_deref(),
            Some("{}")
        );

        ws_send_text(&mut server.ws_stream, "hello".into()).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.into_text().unwrap(), "hello");

        client.close(None).await.unwrap();
        assert_eq!(ws_recv_text(&mut server.ws_stream).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_utf8_binary_is_an_error() {
        let (addr, mut rx, _cancel) = listen().await;
        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let mut server = rx.recv().await.unwrap();

        client.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
        let err = ws_recv_text(&mut server.ws_stream).await.unwrap_err();
        assert!(matches!(err, ConductorError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn cancel_stops_the_listener() {
        let (_addr, mut rx, cancel) = listen().await;
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
