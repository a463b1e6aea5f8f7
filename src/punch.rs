//! Punch coordination for one tunnel
//!
//! A tunnel owns two listeners: the public one external peers connect to,
//! and an ephemeral one the owning client reconnects to. Each accepted
//! external connection triggers a `CONNECT <client_port> <nonce>` challenge
//! on the control connection. The client's answering connection on the
//! ephemeral port must present the nonce before the punch window closes;
//! the two sockets are then handed to a detached relay.
//!
//! Challenges are strictly serialized per tunnel: the public listener is not
//! polled again until the current challenge resolves, so the ephemeral
//! listener has at most one legitimate candidate at a time.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{timeout, timeout_at, Instant};

use crate::nonce::Nonce;
use crate::protocol::{ServerMessage, NONCE_LENGTH, PUNCH_TIMEOUT};
use crate::registry::{RegistryError, Tunnel, TunnelLease, TunnelRegistry};
use crate::relay::{self, RelayTotals};
use crate::server::ServerMetrics;
use crate::session::{ControlChannel, ControlEvent};

/// Nonces of failed challenges remembered per tunnel to recognise late reconnections
const EXPIRED_NONCE_HISTORY: usize = 8;

/// Pause after a failed accept on the public listener (EMFILE and friends)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Punch coordinator configuration
#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// Address public and ephemeral listeners bind to
    pub bind_ip: IpAddr,
    /// Window for the client to answer a challenge
    pub punch_timeout: Duration,
    /// Nonce length in bytes
    pub nonce_length: usize,
    /// How long a relay keeps the surviving direction open after the other ends
    pub relay_grace: Duration,
    /// Challenges allowed to be outstanding across all tunnels
    pub max_pending_punches: usize,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            punch_timeout: PUNCH_TIMEOUT,
            nonce_length: NONCE_LENGTH,
            relay_grace: Duration::from_secs(5),
            max_pending_punches: 256,
        }
    }
}

/// Lifecycle of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Binding,
    Active,
    Draining,
    Closed,
}

/// One outstanding pairing attempt
#[derive(Debug)]
pub struct PunchChallenge {
    pub nonce: Nonce,
    pub issued_at: Instant,
}

impl PunchChallenge {
    pub fn issue(nonce_length: usize) -> Self {
        Self {
            nonce: Nonce::generate(nonce_length),
            issued_at: Instant::now(),
        }
    }

    pub fn deadline(&self, window: Duration) -> Instant {
        self.issued_at + window
    }
}

/// Failure to bring a tunnel up. Fatal to the OPEN request only.
#[derive(Debug, Error)]
pub enum BindError {
    #[error(transparent)]
    Conflict(#[from] RegistryError),

    #[error("Failed to bind public port {port}: {source}")]
    Public { port: u16, source: io::Error },

    #[error("Failed to bind client port: {0}")]
    Ephemeral(io::Error),
}

/// Failure of one challenge. Never tears down the tunnel.
#[derive(Debug, Error)]
pub enum PunchError {
    #[error("Wrong nonce from {peer}")]
    Mismatch { peer: SocketAddr },

    #[error("No verified reconnection within {0:?}")]
    Timeout(Duration),

    #[error("Accept on client port failed: {0}")]
    Accept(io::Error),

    #[error("Reading nonce from {peer} failed: {source}")]
    Handshake { peer: SocketAddr, source: io::Error },
}

/// How a single external connection was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchOutcome {
    /// Verified and handed to a relay
    Relayed,
    /// Mismatch, timeout or accept error; external connection closed
    Failed,
    /// Pending-challenge bound exhausted; external connection closed unanswered
    Rejected,
}

/// Why a tunnel's accept loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelExit {
    ControlClosed,
    CloseRequested,
    Shutdown,
}

impl From<ControlEvent> for TunnelExit {
    fn from(event: ControlEvent) -> Self {
        match event {
            ControlEvent::Closed => TunnelExit::ControlClosed,
            ControlEvent::CloseRequested => TunnelExit::CloseRequested,
        }
    }
}

/// A tunnel whose listeners are bound and which is registered
pub struct BoundTunnel {
    public: TcpListener,
    ephemeral: TcpListener,
    lease: TunnelLease,
    client_port: u16,
    state: TunnelState,
    expired: VecDeque<Nonce>,
}

impl BoundTunnel {
    pub fn public_port(&self) -> u16 {
        self.lease.public_port()
    }

    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    fn transition(&mut self, next: TunnelState) {
        tracing::debug!(
            public_port = self.public_port(),
            from = ?self.state,
            to = ?next,
            "Tunnel state change"
        );
        self.state = next;
    }

    fn record(&self, totals: RelayTotals) {
        self.lease.record(totals.a_to_b, totals.b_to_a);
    }

    fn expire(&mut self, nonce: Nonce) {
        if self.expired.len() == EXPIRED_NONCE_HISTORY {
            self.expired.pop_front();
        }
        self.expired.push_back(nonce);
    }

    /// Accept on the client port until a connection presents `nonce`.
    ///
    /// Connections presenting an expired nonce are closed and skipped; any
    /// other token resolves the challenge as a mismatch.
    async fn accept_verified(&self, nonce: &Nonce) -> Result<(TcpStream, SocketAddr), PunchError> {
        loop {
            let (mut stream, peer) = self.ephemeral.accept().await.map_err(PunchError::Accept)?;

            let mut presented = vec![0u8; nonce.len()];
            if let Err(e) = stream.read_exact(&mut presented).await {
                return Err(match e.kind() {
                    io::ErrorKind::UnexpectedEof => PunchError::Mismatch { peer },
                    _ => PunchError::Handshake { peer, source: e },
                });
            }

            if nonce.matches(&presented) {
                return Ok((stream, peer));
            }

            if self.expired.iter().any(|old| old.matches(&presented)) {
                tracing::debug!(
                    public_port = self.public_port(),
                    %peer,
                    "Discarding late reconnection for an expired challenge"
                );
                continue;
            }

            return Err(PunchError::Mismatch { peer });
        }
    }

    fn close(mut self) {
        self.transition(TunnelState::Draining);
        let public_port = self.public_port();
        let BoundTunnel {
            public,
            ephemeral,
            lease,
            ..
        } = self;
        drop(public);
        drop(ephemeral);
        drop(lease);
        tracing::debug!(public_port, to = ?TunnelState::Closed, "Tunnel state change");
    }
}

/// Creates tunnels and runs their accept loops
#[derive(Clone)]
pub struct PunchCoordinator {
    config: PunchConfig,
    registry: Arc<TunnelRegistry>,
    metrics: Arc<ServerMetrics>,
    pending: Arc<Semaphore>,
}

impl PunchCoordinator {
    pub fn new(config: PunchConfig, registry: Arc<TunnelRegistry>, metrics: Arc<ServerMetrics>) -> Self {
        let pending = Arc::new(Semaphore::new(config.max_pending_punches));
        Self {
            config,
            registry,
            metrics,
            pending,
        }
    }

    pub fn config(&self) -> &PunchConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Bind the public and client listeners and register the tunnel.
    ///
    /// Any failure unwinds what was already bound and leaves the registry
    /// untouched.
    pub async fn bind(
        &self,
        owner: &str,
        public_port: u16,
        client_addr: SocketAddr,
    ) -> Result<BoundTunnel, BindError> {
        tracing::debug!(public_port, state = ?TunnelState::Binding, "Binding tunnel");

        if self.registry.contains(public_port) {
            return Err(RegistryError::PortInUse(public_port).into());
        }

        let public = TcpListener::bind((self.config.bind_ip, public_port))
            .await
            .map_err(|source| BindError::Public {
                port: public_port,
                source,
            })?;

        let ephemeral = TcpListener::bind((self.config.bind_ip, 0))
            .await
            .map_err(BindError::Ephemeral)?;
        let client_port = ephemeral.local_addr().map_err(BindError::Ephemeral)?.port();

        let lease = self
            .registry
            .register(Tunnel::new(owner, public_port, client_port, client_addr))?;

        let mut tunnel = BoundTunnel {
            public,
            ephemeral,
            lease,
            client_port,
            state: TunnelState::Binding,
            expired: VecDeque::with_capacity(EXPIRED_NONCE_HISTORY),
        };
        tunnel.transition(TunnelState::Active);

        tracing::info!(public_port, client_port, owner, %client_addr, "Tunnel opened");
        Ok(tunnel)
    }

    /// Serve external connections until the control connection goes away,
    /// the client sends CLOSE, or the server shuts down.
    ///
    /// Relays spawned by this tunnel outlive it; their byte counts are only
    /// folded into the tunnel while it is still running.
    pub async fn run(
        &self,
        mut tunnel: BoundTunnel,
        control: &mut ControlChannel,
        mut shutdown: watch::Receiver<bool>,
    ) -> TunnelExit {
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<RelayTotals>();

        let exit = if *shutdown.borrow() {
            TunnelExit::Shutdown
        } else {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break TunnelExit::Shutdown;
                        }
                    }

                    Some(totals) = relay_rx.recv() => tunnel.record(totals),

                    event = control.next_event() => break TunnelExit::from(event),

                    accepted = tunnel.public.accept() => match accepted {
                        Ok((external, external_addr)) => {
                            match self.punch(&mut tunnel, control, external, external_addr, &relay_tx).await {
                                Ok(outcome) => tracing::trace!(?outcome, "Challenge resolved"),
                                Err(exit) => break exit,
                            }
                        }
                        Err(e) => {
                            tracing::warn!(public_port = tunnel.public_port(), error = %e, "Accept on public port failed");
                            self.metrics.error_occurred();
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    },
                }
            }
        };

        tracing::info!(public_port = tunnel.public_port(), ?exit, "Closing tunnel");
        tunnel.close();
        exit
    }

    /// Run one challenge for an accepted external connection.
    ///
    /// Returns `Err` only when the control connection is gone.
    async fn punch(
        &self,
        tunnel: &mut BoundTunnel,
        control: &mut ControlChannel,
        external: TcpStream,
        external_addr: SocketAddr,
        relay_tx: &mpsc::UnboundedSender<RelayTotals>,
    ) -> Result<PunchOutcome, TunnelExit> {
        let public_port = tunnel.public_port();

        let Ok(_permit) = self.pending.try_acquire() else {
            tracing::warn!(public_port, %external_addr, "Pending punch limit reached, dropping external connection");
            self.metrics.punch_rejected();
            return Ok(PunchOutcome::Rejected);
        };

        let challenge = PunchChallenge::issue(self.config.nonce_length);
        let message = ServerMessage::connect(tunnel.client_port(), challenge.nonce.as_str());
        match timeout(self.config.punch_timeout, control.send(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(public_port, error = %e, "Failed to send challenge, control connection lost");
                return Err(TunnelExit::ControlClosed);
            }
            Err(_) => {
                tracing::warn!(public_port, "Control connection stopped reading, challenge not delivered");
                return Err(TunnelExit::ControlClosed);
            }
        }

        tracing::debug!(
            public_port,
            client_port = tunnel.client_port(),
            %external_addr,
            "Challenge issued"
        );

        let deadline = challenge.deadline(self.config.punch_timeout);
        let result = tokio::select! {
            verified = timeout_at(deadline, tunnel.accept_verified(&challenge.nonce)) => {
                verified.unwrap_or_else(|_| Err(PunchError::Timeout(self.config.punch_timeout)))
            }
            event = control.next_event() => return Err(TunnelExit::from(event)),
        };

        match result {
            Ok((punched, punched_addr)) => {
                tracing::info!(
                    public_port,
                    %external_addr,
                    %punched_addr,
                    elapsed_ms = challenge.issued_at.elapsed().as_millis() as u64,
                    "Punch succeeded"
                );
                self.metrics.punch_succeeded();
                self.spawn_relay(public_port, external, punched, relay_tx.clone());
                Ok(PunchOutcome::Relayed)
            }
            Err(e) => {
                match &e {
                    PunchError::Timeout(_) => self.metrics.punch_timed_out(),
                    PunchError::Mismatch { .. } => self.metrics.punch_mismatched(),
                    PunchError::Accept(_) | PunchError::Handshake { .. } => self.metrics.error_occurred(),
                }
                tracing::warn!(public_port, %external_addr, error = %e, "Punch failed, closing external connection");
                // The client may still answer this challenge after it failed
                tunnel.expire(challenge.nonce);
                drop(external);
                Ok(PunchOutcome::Failed)
            }
        }
    }

    fn spawn_relay(
        &self,
        public_port: u16,
        external: TcpStream,
        punched: TcpStream,
        relay_tx: mpsc::UnboundedSender<RelayTotals>,
    ) {
        let metrics = Arc::clone(&self.metrics);
        let grace = self.config.relay_grace;

        tokio::spawn(async move {
            metrics.relay_started();
            let totals = relay::run(external, punched, grace).await;
            metrics.relay_finished(totals.a_to_b + totals.b_to_a);

            tracing::info!(
                public_port,
                bytes_received = totals.a_to_b,
                bytes_sent = totals.b_to_a,
                "Relay finished"
            );

            // Receiver is gone once the tunnel has closed
            let _ = relay_tx.send(totals);
        });
    }
}
