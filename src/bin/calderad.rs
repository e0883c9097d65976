//! Caldera Daemon - relay hub for boiler actuator, sensor and observers
//!
//! This binary runs the relay in the foreground: hardware nodes and
//! dashboards connect over WebSocket, the hub keeps the global state and
//! forces the output OFF whenever a control node goes away.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon
//! calderad start
//!
//! # Start with a custom config file and listen address
//! calderad --config ./calderad.toml --listen 127.0.0.1:9000 start
//!
//! # Print the effective configuration
//! calderad check-config
//!
//! # Enable debug logging
//! RUST_LOG=calderad=debug calderad start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use calderad::config::RelayConfig;
use calderad::diagnostics::spawn_diagnostics_task;
use calderad::hub::spawn_hub;
use calderad::monitor::spawn_liveness_monitor;
use calderad::server::RelayServer;

/// Caldera daemon - real-time relay and fail-safe controller
#[derive(Parser, Debug)]
#[command(name = "calderad", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CALDERA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Address to accept WebSocket connections on
    #[arg(short, long, env = "CALDERA_LISTEN", global = true)]
    listen: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start,
    /// Print the effective configuration and exit
    CheckConfig,
}

/// Applies defaults, the config file and command-line overrides.
fn load_config(args: &Args) -> Result<RelayConfig> {
    let mut config = RelayConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command.unwrap_or(Command::Start) {
        Command::Start => run_daemon(config),
        Command::CheckConfig => {
            let rendered = config.to_toml().context("Failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: RelayConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("calderad=info".parse()?)
                .add_directive("caldera_core=info".parse()?)
                .add_directive("caldera_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        listen = %config.listen,
        actuator = %config.actuator_id,
        sensor = %config.sensor_id,
        "Caldera daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let hub = spawn_hub(config.hub_settings()?);
    info!("Relay hub started");

    let monitor_handle =
        spawn_liveness_monitor(hub.clone(), config.probe_interval(), cancel_token.clone());
    let diagnostics_handle = spawn_diagnostics_task(
        hub.clone(),
        config.diagnostics_interval(),
        cancel_token.clone(),
    );

    let server = RelayServer::new(
        config.listen,
        hub,
        cancel_token.clone(),
        config.server_settings(),
    );

    let result = server.run().await;

    // Stop background tasks even when the server failed to start
    cancel_token.cancel();
    let _ = monitor_handle.await;
    let _ = diagnostics_handle.await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Caldera daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
