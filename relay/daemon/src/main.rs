//! Relay Daemon - Resumable Conversation Streams over SSE
//!
//! Entry point for the relay daemon. Browsers (or any SSE client) open a
//! stream per conversation; if the connection drops they reconnect with the
//! last sequence they saw and pick up where they left off.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:3001)
//! relay-daemon
//!
//! # Custom listen address
//! relay-daemon --listen 0.0.0.0:8080
//!
//! # With config file
//! relay-daemon --config /etc/resumable-relay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown. Every session is ended first so
//!   open streams close and the server can drain.

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use relay_core::{
    default_config_path, load_config_from_path, ConfigOverrides, RelayConfig, SessionRegistry,
};

/// Relay Daemon - resumable multi-observer streaming over SSE
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(
        short = 'L',
        long = "listen",
        env = "RELAY_LISTEN_ADDR",
        value_name = "ADDR"
    )]
    listen_addr: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds a finished, unobserved session is kept
    #[arg(long, env = "RELAY_IDLE_TIMEOUT_SECS", value_name = "SECS")]
    idle_timeout_secs: Option<u64>,

    /// Seconds between idle sweeps
    #[arg(long, env = "RELAY_SWEEP_INTERVAL_SECS", value_name = "SECS")]
    sweep_interval_secs: Option<u64>,

    /// Milliseconds between simulated words
    #[arg(long, env = "RELAY_PACING_MS", value_name = "MS")]
    pacing_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            idle_timeout_secs: self.idle_timeout_secs,
            sweep_interval_secs: self.sweep_interval_secs,
            pacing_ms: self.pacing_ms,
            listen_addr: self.listen_addr.clone(),
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Merge file, environment and CLI settings
fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path)
        .context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Resolve once SIGTERM or SIGINT arrives
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, relying on Ctrl-C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT, initiating shutdown"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    info!(
        listen_addr = %config.listen_addr,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        pacing_ms = u64::try_from(config.pacing.as_millis()).unwrap_or(u64::MAX),
        source = ?config.source(),
        "Configuration resolved"
    );

    let listener = TcpListener::bind(config.listen_addr.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let registry = Arc::new(SessionRegistry::simulated(config));
    registry.start_sweeper();

    // Ending every session closes the open SSE streams, which lets the
    // graceful shutdown finish.
    let on_shutdown = Arc::clone(&registry);
    let shutdown = async move {
        shutdown_signal().await;
        on_shutdown.shutdown();
    };

    let app_registry = Arc::clone(&registry);
    let result = server::serve(app_registry, listener, shutdown).await;

    info!("Shutting down...");
    registry.shutdown();

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
