//! Graceful shutdown coordination via `CancellationToken`.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Why the relay is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / SIGTERM.
    Signal,
    /// The upstream sent `Terminate`.
    Terminated,
    /// Reconnection attempts were exhausted.
    UpstreamLost,
    /// The payload could not be delivered at startup.
    BootstrapFailed,
}

impl ShutdownReason {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownReason::Signal | ShutdownReason::Terminated => 0,
            ShutdownReason::UpstreamLost | ShutdownReason::BootstrapFailed => 1,
        }
    }
}

/// Coordinates shutdown across the listener, sessions and background tasks.
#[derive(Debug, Default)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
    reason: OnceLock<ShutdownReason>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown. The first reason wins.
    pub fn trigger(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            info!(?reason, "shutting down");
        }
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Spawn a tracked background task.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Number of tracked tasks still running.
    pub fn running_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `timeout` for tracked tasks to finish.
    pub async fn drain(&self, timeout: Duration) {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.running_tasks(),
                "shutdown timed out after {timeout:?}, some tasks may still be running"
            );
        }
    }
}
