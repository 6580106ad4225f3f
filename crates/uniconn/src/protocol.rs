//! Wire protocol for relay reservations, circuits and hole punching
//!
//! Every control message is a bincode-encoded enum; byte framing is the
//! transport's job. The relay protocol runs on control connections to a
//! relay, the DCUtR messages ride an established relayed connection.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::{ConnectivityError, ConnectivityResult};

/// Unique peer identifier (blake3 of the peer's public key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn from_public_key(key: &[u8; 32]) -> Self {
        let hash = blake3::hash(key);
        Self(*hash.as_bytes())
    }

    /// Short hex form for display (8 bytes = 16 chars)
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Full hex form (64 chars)
    pub fn to_full_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from full hex string
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }

    /// Random id, handy for tests and examples
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identifier of a relayed circuit, chosen by the requesting side
pub type CircuitId = u64;

/// Where a peer record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoverySource {
    Mdns,
    Pubsub,
    Dht,
    Bootstrap,
    Manual,
}

impl std::fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiscoverySource::Mdns => "mdns",
            DiscoverySource::Pubsub => "pubsub",
            DiscoverySource::Dht => "dht",
            DiscoverySource::Bootstrap => "bootstrap",
            DiscoverySource::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Why a relay refused a reservation or circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    /// A hard ceiling (reservations, circuits, circuits-per-peer) was hit
    ResourceLimit,
    /// Too many requests from this peer in a short window
    RateLimited,
    /// The target holds no valid reservation
    NoReservation,
    /// Refused by local policy
    Policy,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DenyReason::ResourceLimit => "resource limit reached",
            DenyReason::RateLimited => "rate limited",
            DenyReason::NoReservation => "target has no reservation",
            DenyReason::Policy => "refused by policy",
        };
        f.write_str(s)
    }
}

/// Relay control protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayMessage {
    /// First frame on any control connection, identifies the sender
    Hello { peer: PeerId },

    /// Request a reservation slot on the relay
    Reserve,
    /// Reservation granted (also answers a renewal)
    ReserveOk {
        /// Seconds until the reservation expires
        ttl_secs: u64,
        /// Opaque proof the client presents when being dialed through us
        #[serde(with = "serde_bytes")]
        proof: Vec<u8>,
    },
    /// Reservation refused
    ReserveDenied { reason: DenyReason },
    /// Renew a held reservation before it expires
    Renew,

    /// Ask the relay to open a circuit to `dst`
    CircuitRequest { circuit: CircuitId, dst: PeerId },
    /// Relay tells the reserved destination about an incoming circuit
    CircuitOpen { circuit: CircuitId, src: PeerId },
    /// Destination accepts or rejects the incoming circuit
    CircuitAck { circuit: CircuitId, accept: bool },
    /// Relay confirms the circuit to the requester
    CircuitGranted { circuit: CircuitId },
    /// Relay refuses the circuit
    CircuitDenied { circuit: CircuitId, reason: DenyReason },

    /// Relayed payload bytes, forwarded verbatim by the relay
    Data {
        circuit: CircuitId,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Tear down a circuit
    CircuitClose { circuit: CircuitId },
}

/// Hole-punch coordination messages, exchanged over the relayed connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DcutrMessage {
    /// Candidate direct addresses plus the sender's round-trip estimate
    Connect {
        candidates: Vec<SocketAddr>,
        rtt_micros: u64,
    },
    /// Both sides dial `dial_after_micros` after this message
    Sync { dial_after_micros: u64 },
}

/// Self-announcement published on discovery topics and mDNS responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub peer: PeerId,
    pub addresses: Vec<SocketAddr>,
    pub relay_capable: bool,
}

/// Multicast discovery packets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MdnsMessage {
    /// Who-is-running query for a service name
    Query { service: String },
    /// Answer carrying the responder's record
    Response {
        service: String,
        announcement: Announcement,
    },
}

/// Serialize a message to bytes
pub fn encode<T: Serialize>(msg: &T) -> ConnectivityResult<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| ConnectivityError::Serialization(e.to_string()))
}

/// Deserialize a message from bytes
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> ConnectivityResult<T> {
    bincode::deserialize(data).map_err(|e| ConnectivityError::Serialization(e.to_string()))
}
