//! conductor: relay between Steam's shared JS context and local clients.
//!
//! Injects a payload into Steam's SharedJSContext through the DevTools
//! endpoint. The payload connects back as the privileged upstream, and any
//! number of local WebSocket clients can then issue commands through the
//! relay.

mod auth;
mod config;
mod host;
mod process;
mod relay;
mod server;
mod shutdown;
mod transport;

use anyhow::Context;
use clap::Parser;
use conductor_core::{generate_secret, PayloadTemplate};
use config::RelayConfig;
use host::{debugging, DevToolsHost, Discovery};
use process::InstanceGuard;
use relay::{ConnectionRegistry, ReconnectOutcome, ReconnectSupervisor, RelayContext};
use server::RelayServer;
use shutdown::ShutdownReason;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long tracked tasks get to finish after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// conductor: Steam SharedJSContext relay
#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Steam SharedJSContext relay")]
struct Cli {
    /// Settings file path
    #[arg(long, default_value = "settings.toml")]
    settings: PathBuf,

    /// Listen port (overrides the settings file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address (overrides the settings file)
    #[arg(long)]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Do not stop a previously started conductor
    #[arg(long)]
    no_instance_guard: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting conductor");

    match run(cli).await {
        Ok(reason) => {
            info!(?reason, "conductor stopped");
            ExitCode::from(u8::try_from(reason.exit_code()).unwrap_or(1))
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "conductor failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ShutdownReason> {
    let config = RelayConfig::load(Some(cli.settings.as_path()), cli.host.as_deref(), cli.port)
        .context("failed to load settings")?;

    let _instance = if cli.no_instance_guard {
        None
    } else {
        let path = InstanceGuard::default_path().context("cannot locate PID file")?;
        let guard = InstanceGuard::acquire(path)
            .await
            .context("failed to record instance PID")?;
        info!(pid = guard.pid(), path = %guard.path().display(), "instance recorded");
        Some(guard)
    };

    if config.enable_remote_debugging {
        if let Err(e) = debugging::enable_remote_debugging() {
            warn!(error = %e, "could not enable remote debugging, enable it manually");
        }
    }

    let template = PayloadTemplate::load(&config.payload_path)
        .with_context(|| format!("failed to load payload {}", config.payload_path.display()))?;

    let auth = config.auth_gate();
    if auth.is_enabled() {
        info!(tokens = auth.len(), "client authentication enabled");
    } else {
        warn!("client authentication disabled, any local process can send commands");
    }

    let secret = generate_secret();
    let discovery = Discovery::new(&config.discovery_url, &config.target_title)
        .context("failed to set up debugger discovery")?;
    let supervisor = ReconnectSupervisor::new(
        Arc::new(DevToolsHost::new(discovery.clone())),
        template,
        config.port,
        config.reconnect,
    );
    let policy = supervisor.policy();
    info!(
        max_tries = policy.max_tries(),
        backoff_ms = policy.backoff().as_millis() as u64,
        handshake_timeout_ms = policy.handshake_timeout().as_millis() as u64,
        "reconnection policy"
    );
    let ctx = RelayContext::new(ConnectionRegistry::new(secret.clone()), auth, supervisor);

    let server = RelayServer::bind(Arc::clone(&ctx), &config.listen_addr())
        .await
        .context("failed to start listener")?;
    let server_task = tokio::spawn(server.run());

    let boot_ctx = Arc::clone(&ctx);
    ctx.shutdown().spawn(bootstrap(
        boot_ctx,
        discovery,
        config.discovery_interval,
        secret,
        config.payload_tries,
    ));

    let token = ctx.shutdown().token();
    tokio::select! {
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            ctx.request_shutdown(ShutdownReason::Signal).await;
        }
        _ = token.cancelled() => {}
    }

    let _ = server_task.await;
    ctx.shutdown().drain(SHUTDOWN_GRACE).await;

    Ok(ctx.shutdown().reason().unwrap_or(ShutdownReason::Signal))
}

/// Wait for Steam to expose its debugger, then deliver the first payload.
async fn bootstrap(
    ctx: Arc<RelayContext>,
    discovery: Discovery,
    interval: Duration,
    secret: String,
    tries: u32,
) {
    let cancel = ctx.shutdown().token();

    info!("waiting for Steam...");
    if discovery.wait_for_debugger_url(interval, &cancel).await.is_none() {
        return;
    }

    info!("sending payload...");
    match ctx.supervisor().bootstrap(&secret, tries, &cancel).await {
        ReconnectOutcome::Delivered => info!("payload sent, waiting for Steam to connect"),
        ReconnectOutcome::Cancelled => {}
        ReconnectOutcome::Failed(e) => {
            error!(error = %e, "could not deliver payload");
            ctx.request_shutdown(ShutdownReason::BootstrapFailed).await;
        }
        outcome => {
            error!(?outcome, "could not deliver payload");
            ctx.request_shutdown(ShutdownReason::BootstrapFailed).await;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
