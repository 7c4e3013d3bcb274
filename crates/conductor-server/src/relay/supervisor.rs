//! Reconnection supervisor.
//!
//! At most one runs at a time (the registry's single-flight guard makes
//! sure of that). For each reconnection cycle it rotates the handshake
//! secret, renders a fresh payload and re-delivers it to the host until a
//! new upstream completes the handshake, retrying with a fixed backoff. If
//! the relay recovers and loses the upstream again before the supervisor
//! notices, it starts over with a fresh secret and a full set of attempts.
//! When every attempt is used up the caller shuts the relay down.

use super::registry::{ConnectionRegistry, ReconnectProgress, RelayMode};
use crate::host::{HostDebugger, InjectError};
use conductor_core::{generate_secret, PayloadTemplate};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of delivery attempts.
pub const MAX_RECONNECT_TRIES: u32 = 5;

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// Retry limits for payload delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_tries: u32,
    backoff: Duration,
    handshake_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_TRIES, MIN_BACKOFF, Duration::from_secs(1))
    }
}

impl ReconnectPolicy {
    /// `backoff` is clamped to 0.5–1s.
    pub fn new(max_tries: u32, backoff: Duration, handshake_timeout: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            backoff: backoff.clamp(MIN_BACKOFF, MAX_BACKOFF),
            handshake_timeout,
        }
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

/// How a delivery loop ended.
#[derive(Debug)]
pub enum ReconnectOutcome {
    /// A new upstream completed the handshake.
    Recovered,
    /// The payload was accepted by the host (startup only).
    Delivered,
    /// Shutdown was requested.
    Cancelled,
    /// Every attempt failed.
    Exhausted,
    /// The host failed in a way retrying will not fix.
    Failed(InjectError),
}

impl ReconnectOutcome {
    /// Whether the relay cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconnectOutcome::Exhausted | ReconnectOutcome::Failed(_))
    }
}

/// Re-delivers the payload to the host.
pub struct ReconnectSupervisor {
    host: Arc<dyn HostDebugger>,
    template: PayloadTemplate,
    port: u16,
    policy: ReconnectPolicy,
}

impl ReconnectSupervisor {
    pub fn new(
        host: Arc<dyn HostDebugger>,
        template: PayloadTemplate,
        port: u16,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            host,
            template,
            port,
            policy,
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Initial delivery at startup, using the secret the registry was
    /// created with.
    pub async fn bootstrap(
        &self,
        secret: &str,
        tries: u32,
        cancel: &CancellationToken,
    ) -> ReconnectOutcome {
        let payload = self.template.render(self.port, secret, true);
        let tries = tries.max(1);

        for attempt in 1..=tries {
            let delivered = tokio::select! {
                r = self.host.inject(&payload) => r,
                _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            };
            match delivered {
                Ok(()) => {
                    debug!(attempt, "payload delivered");
                    return ReconnectOutcome::Delivered;
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "failed to send payload, retrying...");
                }
                Err(e) => return ReconnectOutcome::Failed(e),
            }
            if attempt < tries && !self.pause(cancel).await {
                return ReconnectOutcome::Cancelled;
            }
        }

        error!("failed to send payload, check that Steam is running with remote debugging enabled");
        ReconnectOutcome::Exhausted
    }

    /// Reconnect after the upstream was lost.
    ///
    /// Rotates the handshake secret before the first delivery of every
    /// cycle, so only a payload rendered for that cycle can complete the
    /// next handshake.
    pub async fn run(
        &self,
        registry: &ConnectionRegistry,
        cancel: &CancellationToken,
    ) -> ReconnectOutcome {
        let (mut cycle, mut payload) = self.begin_cycle(registry).await;
        let max_tries = self.policy.max_tries();

        let mut attempt = 0;
        loop {
            match registry.reconnect_progress(cycle).await {
                ReconnectProgress::Settled(RelayMode::Normal) => {
                    debug!(attempts = attempt, "supervisor finished, upstream is back");
                    return ReconnectOutcome::Recovered;
                }
                ReconnectProgress::Settled(_) => return ReconnectOutcome::Cancelled,
                ReconnectProgress::Restarted => {
                    info!("connection to Steam lost again, starting over");
                    (cycle, payload) = self.begin_cycle(registry).await;
                    attempt = 0;
                }
                ReconnectProgress::Pending => {}
            }
            if attempt == max_tries {
                break;
            }
            attempt += 1;

            info!(attempt, max = max_tries, "connection to Steam lost, resending payload...");
            let delivered = tokio::select! {
                r = self.host.inject(&payload) => r,
                _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            };

            match delivered {
                Ok(()) => {
                    let settled = tokio::select! {
                        s = registry.wait_until_settled(self.policy.handshake_timeout()) => s,
                        _ = registry.wait_for_new_cycle(cycle) => true,
                        _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
                    };
                    if settled {
                        continue;
                    }
                    warn!(attempt, "payload delivered but Steam did not connect back");
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "failed to resend payload");
                }
                Err(e) => {
                    error!(error = %e, "cannot reconnect to Steam");
                    return ReconnectOutcome::Failed(e);
                }
            }

            if attempt < max_tries {
                // A new cycle cuts the backoff short.
                let resumed = tokio::select! {
                    r = self.pause(cancel) => r,
                    _ = registry.wait_for_new_cycle(cycle) => true,
                };
                if !resumed {
                    return ReconnectOutcome::Cancelled;
                }
            }
        }

        error!(tries = max_tries, "connection to Steam lost, giving up");
        ReconnectOutcome::Exhausted
    }

    /// Rotate the secret for the registry's current cycle and render the
    /// payload carrying it.
    async fn begin_cycle(&self, registry: &ConnectionRegistry) -> (u64, String) {
        let secret = generate_secret();
        let payload = self.template.render(self.port, &secret, true);
        let cycle = registry.rotate_secret(secret).await;
        debug!(cycle, "handshake secret rotated");
        (cycle, payload)
    }

    /// Sleep for the backoff; `false` if cancelled first.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.policy.backoff()) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
