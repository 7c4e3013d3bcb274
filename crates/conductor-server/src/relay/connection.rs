//! Connection handles.
//!
//! Every accepted connection gets an outbound mpsc channel drained by its
//! transport task. Other sessions push text frames into it through a
//! [`ConnectionHandle`]; pending requests hold only a [`WeakConnection`], so
//! a client that disconnects is released as soon as its own task ends.

use conductor_core::{ConductorError, ConductorResult};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Strong handle to a live connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote: SocketAddr,
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its transport task drains.
    pub fn new(id: ConnectionId, remote: SocketAddr) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, remote, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Queue a text frame for delivery.
    pub fn send(&self, text: String) -> ConductorResult<()> {
        self.tx.send(text).map_err(|_| ConductorError::Closed)
    }

    /// Weak reference for lookup-only holders.
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            id: self.id,
            remote: self.remote,
            tx: self.tx.downgrade(),
        }
    }
}

/// Weak handle; does not keep the connection's queue alive.
#[derive(Debug, Clone)]
pub struct WeakConnection {
    id: ConnectionId,
    remote: SocketAddr,
    tx: mpsc::WeakUnboundedSender<String>,
}

impl WeakConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Recover a strong handle if the connection is still open.
    pub fn upgrade(&self) -> Option<ConnectionHandle> {
        self.tx.upgrade().map(|tx| ConnectionHandle {
            id: self.id,
            remote: self.remote,
            tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn send_reaches_receiver() {
        let (handle, mut rx) = ConnectionHandle::new(1, addr());
        handle.send("hello".into()).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }

    #[test]
    fn send_after_receiver_dropped_fails() {
        let (handle, rx) = ConnectionHandle::new(1, addr());
        drop(rx);
        assert!(matches!(handle.send("x".into()), Err(ConductorError::Closed)));
    }

    #[test]
    fn weak_handle_dies_with_connection() {
        let (handle, _rx) = ConnectionHandle::new(7, addr());
        let weak = handle.downgrade();
        assert_eq!(weak.upgrade().map(|h| h.id()), Some(7));
        drop(handle);
        assert!(weak.upgrade().is_none());
    }
}
