//! Busway Daemon
//!
//! Standalone bus daemon. Applications connect to it through
//! `busway_core::Connection`.
//!
//! # Usage
//!
//! ```bash
//! # Session bus at the default path ($XDG_RUNTIME_DIR/busway/session_bus_socket)
//! busway-daemon --bus session
//!
//! # Private bus for tests
//! busway-daemon --socket /tmp/test-bus.sock
//!
//! # With verbose logging
//! RUST_LOG=debug busway-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `BUSWAY_SYSTEM_BUS_SOCKET` / `BUSWAY_SESSION_BUS_SOCKET`: Default socket paths
//! - `BUSWAY_BUS`: Which bus to serve when `--bus` is not given
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (removes PID file and socket)

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use busway_core::{BusConfig, BusKind};
use busway_daemon::{BusDaemon, ServerConfig};

/// Message bus daemon for busway connections
#[derive(Debug, Parser)]
#[command(name = "busway-daemon", version, about)]
struct Args {
    /// Which bus to serve (system or session)
    #[arg(long, env = "BUSWAY_BUS", default_value = "session")]
    bus: BusKind,

    /// Socket path (defaults to the configured path of the bus)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Maximum number of concurrent connections
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    /// PID file path (defaults to busway.pid next to the socket)
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

/// Write the PID file
fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let pid = std::process::id();
    let mut file = fs::File::create(path)?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove the PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Set `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: Arc<AtomicBool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }

    shutdown.store(true, Ordering::SeqCst);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("busway_daemon=info".parse()?)
                .add_directive("busway_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    let socket_path = args
        .socket
        .unwrap_or_else(|| BusConfig::from_env().socket_for(args.bus).to_path_buf());
    let pid_path = args
        .pid_file
        .unwrap_or_else(|| socket_path.with_file_name("busway.pid"));

    info!(bus = %args.bus, pid = std::process::id(), "Starting busway daemon");

    if let Err(e) = write_pid_file(&pid_path) {
        error!(error = %e, "Failed to write PID file");
        return Err(anyhow::anyhow!(
            "Failed to write PID file at {pid_path:?}: {e}. Check directory permissions."
        ));
    }

    let daemon = BusDaemon::new(socket_path, args.bus).with_config(ServerConfig {
        max_connections: args.max_connections,
        ..ServerConfig::default()
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    tokio::spawn(wait_for_signal(Arc::clone(&shutdown)));

    let result = daemon.run(shutdown).await;
    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("Busway daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon failed");
            Err(e)
        }
    }
}
