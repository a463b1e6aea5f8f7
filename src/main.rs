//! Punch server
//!
//! Exposes services of clients behind NAT/firewalls on public ports by
//! pairing external connections with connections the client makes outward.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use punchd::auth::{AuthVerifier, CredentialStore, DenyAll};
use punchd::health::{self, HealthState};
use punchd::protocol::{DEFAULT_CONTROL_PORT, NONCE_LENGTH};
use punchd::punch::PunchConfig;
use punchd::server::{self, ServerConfig, ServerState};

/// TCP hole punching coordinator
#[derive(Parser, Debug)]
#[command(name = "punchd")]
#[command(about = "Expose a service behind NAT on a public port of this server")]
struct Args {
    /// Port to listen on for control connections
    #[arg(default_value_t = DEFAULT_CONTROL_PORT, env = "PUNCHD_PORT")]
    port: u16,

    /// Address to bind control, public and client listeners to
    #[arg(long, default_value = "0.0.0.0", env = "PUNCHD_BIND")]
    bind: IpAddr,

    /// Port for the health check HTTP endpoint (disabled if unset)
    #[arg(long, env = "PUNCHD_HEALTH_PORT")]
    health_port: Option<u16>,

    /// JSON credentials file; without one every OPEN is rejected
    #[arg(long, env = "PUNCHD_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Timeout for receiving a client command (seconds)
    #[arg(long, default_value_t = 5, env = "PUNCHD_RECV_TIMEOUT")]
    recv_timeout: u64,

    /// Window for a client to answer a punch challenge (seconds)
    #[arg(long, default_value_t = 10, env = "PUNCHD_PUNCH_TIMEOUT")]
    punch_timeout: u64,

    /// Time a relay keeps one direction open after the other ends (seconds)
    #[arg(long, default_value_t = 5, env = "PUNCHD_RELAY_GRACE")]
    relay_grace: u64,

    /// Maximum concurrent control connections
    #[arg(long, default_value_t = 10000, env = "PUNCHD_MAX_CONNECTIONS")]
    max_connections: usize,

    /// Maximum concurrent tunnels
    #[arg(long, default_value_t = 1024, env = "PUNCHD_MAX_TUNNELS")]
    max_tunnels: usize,

    /// Maximum challenges pending at once across all tunnels
    #[arg(long, default_value_t = 256, env = "PUNCHD_MAX_PENDING_PUNCHES")]
    max_pending_punches: usize,

    /// Time to wait for sessions to finish on shutdown (seconds)
    #[arg(long, default_value_t = 30, env = "PUNCHD_DRAIN_TIMEOUT")]
    drain_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting punch server");
    tracing::info!(port = args.port, bind = %args.bind, health_port = ?args.health_port, "Configuration");

    let server_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(%server_id, "Server ID");

    let verifier: Arc<dyn AuthVerifier> = match &args.credentials {
        Some(path) => {
            let store = CredentialStore::load(path)
                .with_context(|| format!("loading credentials from {}", path.display()))?;
            tracing::info!(users = store.len(), path = %path.display(), "Loaded credentials");
            Arc::new(store)
        }
        None => {
            tracing::warn!("No credentials configured, every OPEN request will be rejected");
            Arc::new(DenyAll)
        }
    };

    let server_config = ServerConfig {
        bind_ip: args.bind,
        listen_port: args.port,
        recv_timeout: Duration::from_secs(args.recv_timeout),
        max_connections: args.max_connections,
        max_tunnels: args.max_tunnels,
    };

    let punch_config = PunchConfig {
        bind_ip: args.bind,
        punch_timeout: Duration::from_secs(args.punch_timeout),
        nonce_length: NONCE_LENGTH,
        relay_grace: Duration::from_secs(args.relay_grace),
        max_pending_punches: args.max_pending_punches,
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(ServerState::new(
        server_config,
        punch_config,
        verifier,
        shutdown_rx.clone(),
    ));

    // Bind before spawning so a taken control port ends the process
    let listener = server::bind_control(&state.config)
        .await
        .with_context(|| format!("binding control port {}", args.port))?;

    let health_handle = args.health_port.map(|port| {
        let health_state = Arc::new(HealthState {
            metrics: Arc::clone(&state.metrics),
            registry: Arc::clone(&state.registry),
            start_time: Instant::now(),
            server_id: server_id.clone(),
        });
        tokio::spawn(health::run_health_server(health_state, args.bind, port))
    });

    let mut server_handle = tokio::spawn(server::serve(
        listener,
        Arc::clone(&state),
        shutdown_rx.clone(),
    ));

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut server_handle => {
            tracing::error!(?result, "Server loop exited unexpectedly");
        }
    }

    tracing::info!("Initiating graceful shutdown...");

    // Signal shutdown; tunnels unregister and stop accepting
    let _ = shutdown_tx.send(true);

    let drain_timeout = Duration::from_secs(args.drain_timeout);
    tracing::info!(timeout_secs = drain_timeout.as_secs(), "Draining sessions");

    tokio::select! {
        _ = tokio::time::sleep(drain_timeout) => {
            tracing::warn!("Drain timeout reached, forcing shutdown");
        }
        _ = async {
            loop {
                let active = state.metrics.active_sessions.load(Ordering::Relaxed);
                if active == 0 {
                    tracing::info!("All sessions drained");
                    break;
                }
                tracing::info!(active, "Waiting for sessions to drain");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        } => {}
    }

    // Abort remaining tasks
    if let Some(handle) = health_handle {
        handle.abort();
    }
    server_handle.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
