//! Connectivity error types

use thiserror::Error;

use crate::protocol::{DenyReason, PeerId};

/// Errors produced by the connectivity subsystem
#[derive(Debug, Error)]
pub enum ConnectivityError {
    /// Relay refused a reservation (limit or policy)
    #[error("reservation denied: {0}")]
    ReservationDenied(DenyReason),

    /// Relay refused a circuit (limit or invalid target)
    #[error("circuit denied: {0}")]
    CircuitDenied(DenyReason),

    /// Direct upgrade attempt failed; the relayed connection stays in use
    #[error("DCUtR failed: {0}")]
    DcutrFailed(String),

    /// Direct upgrade attempt did not complete in time
    #[error("DCUtR timed out")]
    DcutrTimeout,

    /// Upgrade for this peer pair is already running or cooling down
    #[error("DCUtR attempt for this pair not admitted")]
    DcutrNotAdmitted,

    /// Discovery-side transport problem (mDNS socket, publish failure)
    #[error("discovery transport error: {0}")]
    DiscoveryTransport(String),

    /// Relay marked temporarily unusable after repeated failures
    #[error("relay {0} unreachable, backing off")]
    RelayUnreachable(PeerId),

    /// No held or obtainable reservation to dial through
    #[error("no usable relay available")]
    NoRelayAvailable,

    /// Dial to a peer address failed
    #[error("dial failed: {0}")]
    DialFailed(String),

    /// Peer is not known to the store and could not be resolved
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The underlying connection was closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Protocol violation on a control stream
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Message encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Outbound exchange exceeded its timeout
    #[error("operation timed out")]
    Timeout,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The manager is stopping or stopped
    #[error("manager shut down")]
    Shutdown,
}

/// Result type for connectivity operations
pub type ConnectivityResult<T> = Result<T, ConnectivityError>;

impl ConnectivityError {
    /// Whether the caller may retry through the next fallback tier
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ConnectivityError::Shutdown)
    }
}
