//! Circuit relay: reservations and relayed circuits
//!
//! The client half holds reservations on remote relays and dials targets
//! through them; the server half (opt-in) grants reservations, brokers
//! circuits and forwards bytes between the two ends.

pub mod client;
pub mod server;

use std::time::Instant;

use crate::protocol::{CircuitId, PeerId};

pub use client::{RelayClient, Reservation};
pub use server::{RelayLimits, RelayServer, RelayServerStats};

/// Lifecycle of a relayed circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requested, waiting for the destination's acknowledgment
    Pending,
    /// Both ends joined, bytes flowing
    Active,
    /// Torn down cleanly
    Closed,
    /// Errored or timed out
    Failed,
}

/// A relayed circuit between two peers
#[derive(Debug, Clone)]
pub struct Circuit {
    pub id: CircuitId,
    pub relay: PeerId,
    pub src: PeerId,
    pub dst: PeerId,
    pub state: CircuitState,
    pub opened_at: Instant,
}

impl Circuit {
    pub fn new(id: CircuitId, relay: PeerId, src: PeerId, dst: PeerId) -> Self {
        Self {
            id,
            relay,
            src,
            dst,
            state: CircuitState::Pending,
            opened_at: Instant::now(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, CircuitState::Pending | CircuitState::Active)
    }

    pub fn touches(&self, peer: PeerId) -> bool {
        self.src == peer || self.dst == peer
    }
}
