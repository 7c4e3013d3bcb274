//! The Conductor client.
//!
//! `ConductorClient` owns one WebSocket to the relay. Calls are written by a
//! background dispatch task, which also routes every reply to the call that
//! carries the same `messageId`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use conductor_core::error::{ConductorError, ConductorResult};
use conductor_core::messages::{CommandMessage, MESSAGE_ID};

/// Default number of `messageId`s in rotation.
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 500;

/// Configuration for connecting to the relay.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client secret attached to every call (when the relay has auth on).
    pub secret: Option<String>,
    /// Size of the `messageId` rotation; also caps calls in flight.
    pub max_in_flight: u32,
    /// How long a call waits for its reply.
    pub call_timeout: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

type Reply = ConductorResult<Value>;

#[derive(Default)]
struct PendingCalls {
    next_id: u32,
    waiters: HashMap<u32, oneshot::Sender<Reply>>,
    closed: bool,
}

impl PendingCalls {
    fn allocate(&mut self, max: u32) -> ConductorResult<(u32, oneshot::Receiver<Reply>)> {
        if self.closed {
            return Err(ConductorError::Closed);
        }
        let id = self.next_id;
        if self.waiters.contains_key(&id) {
            return Err(ConductorError::Other(format!(
                "too many calls in flight (max {max})"
            )));
        }
        self.next_id = (id + 1) % max.max(1);

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        Ok((id, rx))
    }

    /// Fail every waiting call and refuse new ones.
    fn close(&mut self) {
        self.closed = true;
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(Err(ConductorError::Closed));
        }
    }
}

enum Outgoing {
    Text(String),
    Close,
}

/// A connection to the relay.
pub struct ConductorClient {
    config: ClientConfig,
    outgoing_tx: mpsc::Sender<Outgoing>,
    pending: Arc<Mutex<PendingCalls>>,
    dispatch_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ConductorClient {
    /// Connect to the relay at `url` (e.g. `ws://127.0.0.1:7355`).
    pub async fn connect(url: &str, config: ClientConfig) -> ConductorResult<Self> {
        let (ws, _) = time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| ConductorError::Timeout)?
            .map_err(|e| ConductorError::Transport(format!("WS connect failed: {e}")))?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Outgoing>(256);
        let pending = Arc::new(Mutex::new(PendingCalls::default()));

        let dispatch_handle = tokio::spawn(Self::dispatch_loop(ws, outgoing_rx, pending.clone()));

        Ok(Self {
            config,
            outgoing_tx,
            pending,
            dispatch_handle: Some(dispatch_handle),
        })
    }

    /// Send `command` and wait for its reply.
    ///
    /// The reply is returned without the `messageId` correlation field. A
    /// `success: false` reply becomes [`ConductorError::Rejected`].
    pub async fn call(&self, command: &str, args: Option<Value>) -> ConductorResult<Value> {
        let (id, rx) = self
            .pending
            .lock()
            .await
            .allocate(self.config.max_in_flight)?;

        let message = CommandMessage {
            command: command.to_string(),
            args,
            secret: self.config.secret.clone().map(Value::from),
            message_id: Some(Value::from(id)),
        };
        let sent = match message.to_json() {
            Ok(text) => self
                .outgoing_tx
                .send(Outgoing::Text(text))
                .await
                .map_err(|_| ConductorError::Closed),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.pending.lock().await.waiters.remove(&id);
            return Err(e);
        }

        match time::timeout(self.config.call_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ConductorError::Closed),
            Err(_) => {
                self.pending.lock().await.waiters.remove(&id);
                Err(ConductorError::Timeout)
            }
        }
    }

    /// Whether the connection is still open.
    pub async fn is_connected(&self) -> bool {
        !self.pending.lock().await.closed
    }

    /// Close the connection and wait for the dispatch task to finish.
    pub async fn close(mut self) {
        let _ = self.outgoing_tx.send(Outgoing::Close).await;
        if let Some(handle) = self.dispatch_handle.take() {
            let _ = handle.await;
        }
    }

    async fn dispatch_loop<S>(
        mut ws: tokio_tungstenite::WebSocketStream<S>,
        mut outgoing_rx: mpsc::Receiver<Outgoing>,
        pending: Arc<Mutex<PendingCalls>>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                outgoing = outgoing_rx.recv() => match outgoing {
                    Some(Outgoing::Text(text)) => {
                        if let Err(e) = ws.send(Message::Text(text)).await {
                            tracing::error!("failed to send call: {}", e);
                            break;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = ws.close(None).await;
                        break;
                    }
                },

                incoming = ws.next() => match incoming {
                    Some(Ok(Message::Text(text))) => Self::handle_incoming(&text, &pending).await,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!("relay closed the connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("connection error: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }

        pending.lock().await.close();
        tracing::debug!("dispatch loop ended");
    }

    async fn handle_incoming(text: &str, pending: &Mutex<PendingCalls>) {
        let mut reply = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!("ignoring malformed reply: {}", text);
                return;
            }
        };

        let Some(id) = reply
            .remove(MESSAGE_ID)
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
        else {
            tracing::warn!("reply without messageId: {}", text);
            return;
        };

        let Some(tx) = pending.lock().await.waiters.remove(&id) else {
            tracing::debug!("no call waiting for messageId {}", id);
            return;
        };

        let result = if reply.get("success") == Some(&Value::Bool(false)) {
            let error = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(ConductorError::Rejected(error))
        } else {
            Ok(Value::Object(reply))
        };
        let _ = tx.send(result);
    }
}

impl Drop for ConductorClient {
    fn drop(&mut self) {
        if let Some(h) = self.dispatch_handle.take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// A relay stand-in that answers each call using `respond`.
    async fn fake_relay<F>(respond: F) -> String
    where
        F: Fn(Value) -> Option<Value> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                let call: Value = serde_json::from_str(&text).unwrap();
                if let Some(reply) = respond(call) {
                    ws.send(Message::Text(reply.to_string())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    #[test]
    fn ids_wrap_and_refuse_reuse_while_pending() {
        let mut calls = PendingCalls::default();
        let (a, _ra) = calls.allocate(2).unwrap();
        let (b, _rb) = calls.allocate(2).unwrap();
        assert_eq!((a, b), (0, 1));
        assert!(matches!(calls.allocate(2), Err(ConductorError::Other(_))));

        calls.waiters.remove(&0);
        let (c, _rc) = calls.allocate(2).unwrap();
        assert_eq!(c, 0);
    }

    #[tokio::test]
    async fn close_fails_waiting_calls() {
        let mut calls = PendingCalls::default();
        let (_, rx) = calls.allocate(DEFAULT_MAX_IN_FLIGHT).unwrap();
        calls.close();
        assert!(matches!(rx.await.unwrap(), Err(ConductorError::Closed)));
        assert!(matches!(
            calls.allocate(DEFAULT_MAX_IN_FLIGHT),
            Err(ConductorError::Closed)
        ));
    }

    #[tokio::test]
    async fn call_sends_secret_and_strips_message_id() {
        let url = fake_relay(|call| {
            assert_eq!(call["secret"], "token");
            Some(json!({
                "messageId": call["messageId"],
                "success": true,
                "echo": call["command"],
                "args": call["args"],
            }))
        })
        .await;

        let config = ClientConfig {
            secret: Some("token".into()),
            ..Default::default()
        };
        let client = ConductorClient::connect(&url, config).await.unwrap();
        let reply = client.call("Echo", Some(json!([1]))).await.unwrap();
        assert_eq!(reply, json!({"success": true, "echo": "Echo", "args": [1]}));
        client.close().await;
    }

    #[tokio::test]
    async fn failure_reply_becomes_rejected() {
        let url = fake_relay(|call| {
            Some(json!({
                "success": false,
                "error": "Not connected to Steam",
                "messageId": call["messageId"],
            }))
        })
        .await;

        let client = ConductorClient::connect(&url, ClientConfig::default()).await.unwrap();
        match client.call("Ping", None).await {
            Err(ConductorError::Rejected(msg)) => assert_eq!(msg, "Not connected to Steam"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let url = fake_relay(|_| None).await;
        let config = ClientConfig {
            call_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let client = ConductorClient::connect(&url, config).await.unwrap();
        assert!(matches!(
            client.call("Ping", None).await,
            Err(ConductorError::Timeout)
        ));
        assert!(client.pending.lock().await.waiters.is_empty());
    }

    #[tokio::test]
    async fn connect_refused_is_transport_error() {
        let err = ConductorClient::connect("ws://127.0.0.1:1", ClientConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConductorError::Transport(_)));
    }
}
