//! Universal connectivity layer
//!
//! Keeps peers reachable across NATs:
//! - Peer discovery (multicast, pubsub announcements, DHT lookup, bootstrap)
//! - Circuit relay client and server for NATed nodes
//! - Hole-punched upgrades from relayed to direct connections
//! - A manager tying the services together with shared metrics
//!
//! Transport, encryption and stream multiplexing belong to the embedding
//! host; this crate drives connectivity decisions on top of it.

pub mod config;
pub mod dcutr;
pub mod error;
pub mod manager;
pub mod mdns;
pub mod metrics;
pub mod peer_store;
pub mod protocol;
pub mod pubsub;
pub mod relay;
pub mod timers;
pub mod transport;

pub use config::{BootstrapPeer, ConnectivityConfig};
pub use error::{ConnectivityError, ConnectivityResult};
pub use manager::{Collaborators, ConnectivityManager};
pub use metrics::ConnectivityMetrics;
pub use peer_store::{PeerFilter, PeerRecord, PeerStore};
pub use protocol::{
    Announcement, CircuitId, DcutrMessage, DenyReason, DiscoverySource, MdnsMessage, PeerId,
    RelayMessage,
};
pub use relay::client::{InboundRelayed, RelayClient, Reservation};
pub use relay::server::{RelayLimits, RelayServer, RelayServerStats};
pub use transport::{
    Connection, ConnectionKind, DhtRouter, Host, NatDetector, NatStatus, PubsubBus,
};
