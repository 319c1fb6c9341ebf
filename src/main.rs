#![forbid(unsafe_code)]

//! `vdesk-orchestrator`: virtual desktop session server binary.
//!
//! Bootstraps configuration, builds the session registry, and serves the
//! local control socket for `vdesk-ctl` until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use vdesk_orchestrator::config::GlobalConfig;
use vdesk_orchestrator::ipc::server::spawn_ipc_server;
use vdesk_orchestrator::{AppError, Result, SessionRegistry};

/// Upper bound on waiting for the control server to exit at shutdown.
const IPC_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "vdesk-orchestrator", about = "Virtual desktop session orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Built-in defaults are used
    /// when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the control socket name.
    #[arg(long)]
    ipc_name: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("vdesk-orchestrator bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => {
            let mut config = GlobalConfig::default();
            config.apply_overrides(|key| std::env::var(key).ok())?;
            config
        }
    };
    if let Some(name) = args.ipc_name {
        config.ipc_name = name;
    }
    info!(
        work_root = %config.work_root.display(),
        base_display = config.allocation.base_display,
        base_bridge_port = config.allocation.base_bridge_port,
        capacity = config.allocation.capacity,
        "configuration loaded"
    );

    let registry = SessionRegistry::new(config)?;

    let ct = CancellationToken::new();
    let ipc_handle = spawn_ipc_server(std::sync::Arc::clone(&registry), ct.clone())?;

    shutdown_signal().await;
    info!("shutdown signal received");

    ct.cancel();
    graceful_shutdown(&registry, ipc_handle).await;
    Ok(())
}

/// Stop accepting control commands, then tear down every session,
/// including any still provisioning.
async fn graceful_shutdown(registry: &SessionRegistry, ipc_handle: tokio::task::JoinHandle<()>) {
    match tokio::time::timeout(IPC_SHUTDOWN_TIMEOUT, ipc_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%err, "IPC server task failed"),
        Err(_) => warn!("IPC server did not stop in time"),
    }

    let stopped = registry.shutdown().await;
    info!(sessions = stopped, "shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
