//! Tunnel registry - the set of live public port exposures
//!
//! Keyed by public port. At most one tunnel exists per port; a second
//! registration for a live port is rejected, never overwritten. The
//! coordinator serving a port holds its [`TunnelLease`], which is the only
//! handle able to update that tunnel's byte counters and which unregisters
//! the tunnel when dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

/// One active port exposure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tunnel {
    /// Username that opened the tunnel
    pub owner: String,
    /// Port external peers connect to
    pub public_port: u16,
    /// Ephemeral port the owning client reconnects to
    pub client_port: u16,
    /// Remote address of the control connection
    pub client_addr: SocketAddr,
    /// Bytes relayed from external peers to the client
    pub bytes_received: u64,
    /// Bytes relayed from the client to external peers
    pub bytes_sent: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub opened_at: DateTime<Utc>,
}

impl Tunnel {
    pub fn new(
        owner: impl Into<String>,
        public_port: u16,
        client_port: u16,
        client_addr: SocketAddr,
    ) -> Self {
        Self {
            owner: owner.into(),
            public_port,
            client_port,
            client_addr,
            bytes_received: 0,
            bytes_sent: 0,
            opened_at: Utc::now(),
        }
    }
}

/// Errors from registry operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Port {0} already has an active tunnel")]
    PortInUse(u16),
}

#[derive(Debug, Default)]
struct TunnelCounters {
    received: AtomicU64,
    sent: AtomicU64,
}

struct TunnelEntry {
    tunnel: Tunnel,
    counters: Arc<TunnelCounters>,
}

impl TunnelEntry {
    fn snapshot(&self) -> Tunnel {
        Tunnel {
            bytes_received: self.counters.received.load(Ordering::Relaxed),
            bytes_sent: self.counters.sent.load(Ordering::Relaxed),
            ..self.tunnel.clone()
        }
    }
}

/// Concurrent map of public port -> tunnel
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<u16, TunnelEntry>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tunnel under its public port.
    ///
    /// Fails with [`RegistryError::PortInUse`] if the port is already live,
    /// leaving the existing tunnel untouched.
    pub fn register(self: &Arc<Self>, tunnel: Tunnel) -> Result<TunnelLease, RegistryError> {
        let port = tunnel.public_port;
        let counters = Arc::new(TunnelCounters {
            received: AtomicU64::new(tunnel.bytes_received),
            sent: AtomicU64::new(tunnel.bytes_sent),
        });

        match self.tunnels.entry(port) {
            Entry::Occupied(_) => Err(RegistryError::PortInUse(port)),
            Entry::Vacant(slot) => {
                slot.insert(TunnelEntry {
                    tunnel,
                    counters: Arc::clone(&counters),
                });
                tracing::debug!(public_port = port, "Registered tunnel");
                Ok(TunnelLease {
                    registry: Arc::clone(self),
                    public_port: port,
                    counters,
                })
            }
        }
    }

    /// Remove the tunnel on `public_port`, if any
    pub fn unregister(&self, public_port: u16) {
        if self.tunnels.remove(&public_port).is_some() {
            tracing::debug!(public_port, "Unregistered tunnel");
        }
    }

    /// Copy of every live tunnel, counters included.
    ///
    /// Each entry is copied under its shard's read lock; writers on other
    /// shards are never blocked and no writer waits longer than one copy.
    pub fn snapshot(&self) -> Vec<Tunnel> {
        let mut tunnels: Vec<Tunnel> = self.tunnels.iter().map(|e| e.value().snapshot()).collect();
        tunnels.sort_by_key(|t| t.public_port);
        tunnels
    }

    pub fn get(&self, public_port: u16) -> Option<Tunnel> {
        self.tunnels.get(&public_port).map(|e| e.value().snapshot())
    }

    pub fn contains(&self, public_port: u16) -> bool {
        self.tunnels.contains_key(&public_port)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

/// Ownership of one registered tunnel.
///
/// Held by the coordinator serving the port. Dropping it removes the tunnel
/// from the registry, but only if the entry is still the one this lease
/// created.
pub struct TunnelLease {
    registry: Arc<TunnelRegistry>,
    public_port: u16,
    counters: Arc<TunnelCounters>,
}

impl TunnelLease {
    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    /// Add the byte counts of one finished relay
    pub fn record(&self, received: u64, sent: u64) {
        self.counters.received.fetch_add(received, Ordering::Relaxed);
        self.counters.sent.fetch_add(sent, Ordering::Relaxed);
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        let removed = self
            .registry
            .tunnels
            .remove_if(&self.public_port, |_, entry| {
                Arc::ptr_eq(&entry.counters, &self.counters)
            });
        if removed.is_some() {
            tracing::debug!(public_port = self.public_port, "Released tunnel");
        }
    }
}
