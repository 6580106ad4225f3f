//! Connectivity configuration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::peer_store::PeerRecord;
use crate::protocol::PeerId;
use crate::transport::Connection;

/// Called for every newly discovered peer
pub type DiscoveryCallback = Arc<dyn Fn(&PeerRecord) + Send + Sync>;

/// Called whenever a connection (direct or relayed) is established
pub type ConnectionCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// A peer to contact at startup
#[derive(Debug, Clone)]
pub struct BootstrapPeer {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    /// Whether this peer accepts relay reservations
    pub relay_capable: bool,
}

/// Configuration for the connectivity manager and its services
#[derive(Clone)]
pub struct ConnectivityConfig {
    /// Enable multicast local discovery
    pub enable_mdns: bool,
    /// Enable pubsub announcement discovery
    pub enable_pubsub_discovery: bool,
    /// Consult the DHT router when a peer has no known addresses
    pub enable_dht_discovery: bool,
    /// Poll the external NAT detector
    pub enable_autonat: bool,
    /// Hold relay reservations and dial through relays
    pub enable_relay_client: bool,
    /// Serve reservations and circuits for others (opt-in)
    pub enable_relay_server: bool,
    /// Attempt relay-to-direct upgrades
    pub enable_dcutr: bool,

    /// Ceiling on tracked connections
    pub max_connections: usize,
    /// Reservations held concurrently across relays
    pub max_relay_reservations: usize,
    /// Server-side ceiling on active circuits
    pub max_relay_circuits: usize,
    /// Server-side ceiling on active circuits touching one peer
    pub max_circuits_per_peer: usize,

    /// mDNS service name queried and answered on the local network
    pub mdns_service_name: String,
    /// UDP port for the multicast discovery group
    pub mdns_port: u16,
    pub mdns_query_interval: Duration,

    /// Topics announcements are published and consumed on
    pub pubsub_topics: Vec<String>,
    pub pubsub_announce_interval: Duration,
    /// Identical announcements from one peer are collapsed within this
    /// window. Kept well below `peer_stale_after` so a steadily announcing
    /// peer still refreshes its store record before eviction.
    pub pubsub_dedup_window: Duration,
    /// Subscribe without publishing our own record
    pub pubsub_listen_only: bool,

    pub autonat_query_interval: Duration,

    /// Unconnected records older than this are evicted
    pub peer_stale_after: Duration,
    /// How often the eviction pass runs
    pub eviction_interval: Duration,

    /// Reservation TTL granted by our relay server
    pub reservation_ttl: Duration,
    /// Renewal fires this long before reservation expiry
    pub reservation_renew_margin: Duration,

    /// Timeout for every outbound protocol exchange
    pub request_timeout: Duration,
    /// Timeout for a direct dial attempt
    pub dial_timeout: Duration,
    /// Overall bound on one DCUtR attempt
    pub dcutr_timeout: Duration,
    /// A failed peer pair is not retried before this elapses
    pub dcutr_cooldown: Duration,

    /// Peers contacted when the manager starts
    pub bootstrap_peers: Vec<BootstrapPeer>,

    pub on_peer_discovered: Option<DiscoveryCallback>,
    pub on_connection_established: Option<ConnectionCallback>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enable_mdns: true,
            enable_pubsub_discovery: true,
            enable_dht_discovery: false,
            enable_autonat: true,
            enable_relay_client: true,
            enable_relay_server: false,
            enable_dcutr: true,
            max_connections: 256,
            max_relay_reservations: 3,
            max_relay_circuits: 128,
            max_circuits_per_peer: 8,
            mdns_service_name: "uniconn.local".to_string(),
            mdns_port: 5356,
            mdns_query_interval: Duration::from_secs(60),
            pubsub_topics: vec!["uniconn/discovery/v1".to_string()],
            pubsub_announce_interval: Duration::from_secs(10),
            pubsub_dedup_window: Duration::from_secs(10),
            pubsub_listen_only: false,
            autonat_query_interval: Duration::from_secs(300),
            peer_stale_after: Duration::from_secs(600),
            eviction_interval: Duration::from_secs(60),
            reservation_ttl: Duration::from_secs(300),
            reservation_renew_margin: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            dcutr_timeout: Duration::from_secs(15),
            dcutr_cooldown: Duration::from_secs(120),
            bootstrap_peers: Vec::new(),
            on_peer_discovered: None,
            on_connection_established: None,
        }
    }
}

impl ConnectivityConfig {
    /// Validate limits and intervals
    pub fn validate(&self) -> Result<(), String> {
        if self.max_relay_reservations == 0 && self.enable_relay_client {
            return Err("max_relay_reservations must be > 0 with relay client enabled".into());
        }
        if self.max_circuits_per_peer > self.max_relay_circuits {
            return Err("max_circuits_per_peer cannot exceed max_relay_circuits".into());
        }
        if self.reservation_renew_margin >= self.reservation_ttl {
            return Err("reservation_renew_margin must be shorter than reservation_ttl".into());
        }
        if self.enable_pubsub_discovery && self.pubsub_topics.is_empty() {
            return Err("pubsub discovery enabled with no topics".into());
        }
        if self.pubsub_dedup_window >= self.peer_stale_after {
            return Err("pubsub_dedup_window must be shorter than peer_stale_after".into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConnectivityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityConfig")
            .field("enable_mdns", &self.enable_mdns)
            .field("enable_pubsub_discovery", &self.enable_pubsub_discovery)
            .field("enable_dht_discovery", &self.enable_dht_discovery)
            .field("enable_autonat", &self.enable_autonat)
            .field("enable_relay_client", &self.enable_relay_client)
            .field("enable_relay_server", &self.enable_relay_server)
            .field("enable_dcutr", &self.enable_dcutr)
            .field("max_relay_reservations", &self.max_relay_reservations)
            .field("max_relay_circuits", &self.max_relay_circuits)
            .field("max_circuits_per_peer", &self.max_circuits_per_peer)
            .field("bootstrap_peers", &self.bootstrap_peers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ConnectivityConfig::default().validate().is_ok());
    }

    #[test]
    fn renew_margin_must_fit_ttl() {
        let config = ConnectivityConfig {
            reservation_ttl: Duration::from_secs(30),
            reservation_renew_margin: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn dedup_window_bounded_by_staleness() {
        let config = ConnectivityConfig {
            pubsub_dedup_window: Duration::from_secs(600),
            peer_stale_after: Duration::from_secs(600),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn per_peer_limit_bounded_by_total() {
        let config = ConnectivityConfig {
            max_relay_circuits: 4,
            max_circuits_per_peer: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
