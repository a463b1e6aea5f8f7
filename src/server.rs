//! Control listener and connection dispatch

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};

use crate::auth::AuthVerifier;
use crate::protocol::DEFAULT_CONTROL_PORT;
use crate::punch::{PunchConfig, PunchCoordinator};
use crate::registry::TunnelRegistry;
use crate::session::handle_control;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_ip: IpAddr,
    /// Port for control connections
    pub listen_port: u16,
    /// Timeout for receiving the first command
    pub recv_timeout: Duration,
    /// Maximum concurrent control connections
    pub max_connections: usize,
    /// Maximum concurrent tunnels
    pub max_tunnels: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_CONTROL_PORT,
            recv_timeout: Duration::from_secs(5),
            max_connections: 10000,
            max_tunnels: 1024,
        }
    }
}

/// Server metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub active_sessions: AtomicUsize,
    pub total_sessions: AtomicU64,
    pub rejected_sessions: AtomicU64,
    pub punches_succeeded: AtomicU64,
    pub punch_timeouts: AtomicU64,
    pub punch_mismatches: AtomicU64,
    pub punches_rejected: AtomicU64,
    pub active_relays: AtomicUsize,
    pub bytes_relayed: AtomicU64,
    pub errors: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_rejected(&self) {
        self.rejected_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn punch_succeeded(&self) {
        self.punches_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn punch_timed_out(&self) {
        self.punch_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn punch_mismatched(&self) {
        self.punch_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn punch_rejected(&self) {
        self.punches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_started(&self) {
        self.active_relays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_finished(&self, bytes: u64) {
        self.active_relays.fetch_sub(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn error_occurred(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            rejected_sessions: self.rejected_sessions.load(Ordering::Relaxed),
            punches_succeeded: self.punches_succeeded.load(Ordering::Relaxed),
            punch_timeouts: self.punch_timeouts.load(Ordering::Relaxed),
            punch_mismatches: self.punch_mismatches.load(Ordering::Relaxed),
            punches_rejected: self.punches_rejected.load(Ordering::Relaxed),
            active_relays: self.active_relays.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub rejected_sessions: u64,
    pub punches_succeeded: u64,
    pub punch_timeouts: u64,
    pub punch_mismatches: u64,
    pub punches_rejected: u64,
    pub active_relays: usize,
    pub bytes_relayed: u64,
    pub errors: u64,
}

/// Shared server state
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: Arc<TunnelRegistry>,
    pub coordinator: PunchCoordinator,
    pub verifier: Arc<dyn AuthVerifier>,
    pub metrics: Arc<ServerMetrics>,
    pub tunnel_slots: Arc<Semaphore>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        punch_config: PunchConfig,
        verifier: Arc<dyn AuthVerifier>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        let metrics = Arc::new(ServerMetrics::new());
        let coordinator =
            PunchCoordinator::new(punch_config, Arc::clone(&registry), Arc::clone(&metrics));
        let tunnel_slots = Arc::new(Semaphore::new(config.max_tunnels));

        Self {
            config,
            registry,
            coordinator,
            verifier,
            metrics,
            tunnel_slots,
            shutdown_rx,
        }
    }
}

/// Bind the control listener. Failure here is fatal to the process.
pub async fn bind_control(config: &ServerConfig) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::new(config.bind_ip, config.listen_port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Punch server listening");
    Ok(listener)
}

/// Accept control connections and spawn a session for each
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            // Check for shutdown signal
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Shutdown signal received, stopping accept loop");
                    break;
                }
            }

            // Accept new connections
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let state = Arc::clone(&state);

                        // Check connection limit
                        let active = state.metrics.active_sessions.load(Ordering::Relaxed);
                        if active >= state.config.max_connections {
                            tracing::warn!(active, max = state.config.max_connections, "Connection limit reached");
                            state.metrics.session_rejected();
                            drop(stream);
                            continue;
                        }

                        // Spawn handler task
                        tokio::spawn(async move {
                            state.metrics.session_started();

                            if let Err(e) = handle_control(stream, peer_addr, &state).await {
                                tracing::debug!(%peer_addr, error = %e, "Control connection error");
                                state.metrics.error_occurred();
                            }

                            state.metrics.session_ended();
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                    }
                }
            }
        }
    }

    Ok(())
}
