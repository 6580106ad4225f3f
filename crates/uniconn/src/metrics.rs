//! Connectivity counters
//!
//! Counters are bumped by the paths that own them and exported as a plain
//! snapshot; external observers never see the live atomics.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::protocol::DiscoverySource;
use crate::transport::NatStatus;

/// Read-only snapshot handed to callers of `get_metrics`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityMetrics {
    pub active_connections: u64,
    pub direct_connections: u64,
    pub relay_connections: u64,
    pub connections_established: u64,
    pub connections_failed: u64,
    pub peers_discovered_mdns: u64,
    pub peers_discovered_pubsub: u64,
    pub peers_discovered_dht: u64,
    pub peers_discovered_bootstrap: u64,
    pub peers_discovered_manual: u64,
    pub relay_connections_established: u64,
    pub dcutr_attempts: u64,
    pub dcutr_successes: u64,
    pub nat_status: NatStatus,
}

/// Live counters shared across the manager's components
#[derive(Debug, Default)]
pub struct Metrics {
    active_connections: AtomicU64,
    direct_connections: AtomicU64,
    relay_connections: AtomicU64,
    connections_established: AtomicU64,
    connections_failed: AtomicU64,
    discovered_mdns: AtomicU64,
    discovered_pubsub: AtomicU64,
    discovered_dht: AtomicU64,
    discovered_bootstrap: AtomicU64,
    discovered_manual: AtomicU64,
    relay_connections_established: AtomicU64,
    dcutr_attempts: AtomicU64,
    dcutr_successes: AtomicU64,
    nat_status: AtomicU8,
}

impl Metrics {
    pub fn record_discovered(&self, source: DiscoverySource) {
        let counter = match source {
            DiscoverySource::Mdns => &self.discovered_mdns,
            DiscoverySource::Pubsub => &self.discovered_pubsub,
            DiscoverySource::Dht => &self.discovered_dht,
            DiscoverySource::Bootstrap => &self.discovered_bootstrap,
            DiscoverySource::Manual => &self.discovered_manual,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_direct_connection(&self) {
        self.direct_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_connection(&self) {
        self.relay_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.relay_connections_established
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A relayed link was superseded by a direct one
    pub fn record_upgrade(&self) {
        self.relay_connections.fetch_sub(1, Ordering::Relaxed);
        self.direct_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dcutr_attempt(&self) {
        self.dcutr_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dcutr_success(&self) {
        self.dcutr_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self, relayed: bool) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        if relayed {
            self.relay_connections.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.direct_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn set_nat_status(&self, status: NatStatus) {
        // 0 stays Unknown so freshly built metrics read correctly
        let raw = match status {
            NatStatus::Unknown => 0,
            NatStatus::Public => 1,
            NatStatus::Private => 2,
        };
        self.nat_status.store(raw, Ordering::Relaxed);
    }

    pub fn nat_status(&self) -> NatStatus {
        match self.nat_status.load(Ordering::Relaxed) {
            1 => NatStatus::Public,
            2 => NatStatus::Private,
            _ => NatStatus::Unknown,
        }
    }

    pub fn snapshot(&self) -> ConnectivityMetrics {
        ConnectivityMetrics {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            direct_connections: self.direct_connections.load(Ordering::Relaxed),
            relay_connections: self.relay_connections.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            peers_discovered_mdns: self.discovered_mdns.load(Ordering::Relaxed),
            peers_discovered_pubsub: self.discovered_pubsub.load(Ordering::Relaxed),
            peers_discovered_dht: self.discovered_dht.load(Ordering::Relaxed),
            peers_discovered_bootstrap: self.discovered_bootstrap.load(Ordering::Relaxed),
            peers_discovered_manual: self.discovered_manual.load(Ordering::Relaxed),
            relay_connections_established: self
                .relay_connections_established
                .load(Ordering::Relaxed),
            dcutr_attempts: self.dcutr_attempts.load(Ordering::Relaxed),
            dcutr_successes: self.dcutr_successes.load(Ordering::Relaxed),
            nat_status: self.nat_status(),
        }
    }
}
