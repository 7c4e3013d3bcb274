//! Host collaborators: finding the host's debugger endpoint and injecting
//! the payload through it.
//!
//! # Submodules
//!
//! - **[`discovery`]**: queries the host's debugging-endpoint listing over
//!   HTTP and picks the shared scripting context's debugger URL.
//! - **[`inject`]**: opens a short-lived DevTools WebSocket to that URL and
//!   issues a single `Runtime.evaluate` carrying the payload.
//! - **[`debugging`]**: creates the marker file that makes the host start
//!   with remote debugging enabled.
//!
//! The relay core only sees the [`HostDebugger`] trait, so the reconnection
//! supervisor can be driven by a fake in tests.

pub mod debugging;
pub mod discovery;
pub mod inject;

pub use discovery::Discovery;
pub use inject::DevToolsHost;

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Failures delivering the payload to the host.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("debugger target not found: {0}")]
    TargetNotFound(String),

    #[error("connection to debugger refused: {0}")]
    Refused(String),

    #[error("debugger rejected the connection with HTTP {0}")]
    BadStatus(u16),

    #[error("failed to connect to debugger: {0}")]
    Connect(String),

    #[error("failed to send payload: {0}")]
    NotSent(String),
}

impl InjectError {
    /// Whether the host is probably just not up yet.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InjectError::TargetNotFound(_) | InjectError::Refused(_) | InjectError::BadStatus(_)
        )
    }
}

/// Something that can deliver an injectable payload to the host.
pub trait HostDebugger: Send + Sync {
    /// Deliver `payload`. Success means the debugger accepted the send.
    fn inject<'a>(
        &'a self,
        payload: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), InjectError>> + Send + 'a>>;
}
