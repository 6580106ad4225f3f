//! External collaborator interfaces and the framed connection handle
//!
//! The underlying transport host owns sockets, encryption and stream
//! multiplexing; this subsystem only sees whole frames moving through a
//! [`Connection`]. The remaining collaborators (NAT detector, pub/sub bus,
//! DHT router) are consumed behind traits so tests can script them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::protocol::{decode, encode, PeerId};

/// Frames buffered per connection direction before backpressure
pub const FRAME_QUEUE_DEPTH: usize = 64;

/// How a connection reaches the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Direct,
    Relayed { relay: PeerId },
}

/// A framed, bidirectional connection to a remote peer.
///
/// Send and receive move whole frames; ordering is preserved per direction.
pub struct Connection {
    peer: PeerId,
    remote_addr: SocketAddr,
    kind: ConnectionKind,
    opened_at: Instant,
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
}

impl Connection {
    /// Assemble a connection from raw channel halves (transport adapters)
    pub fn from_parts(
        peer: PeerId,
        remote_addr: SocketAddr,
        kind: ConnectionKind,
        tx: mpsc::Sender<Bytes>,
        rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            peer,
            remote_addr,
            kind,
            opened_at: Instant::now(),
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// In-memory connected pair; `a` talks to `b` and vice versa
    pub fn pair(
        a: PeerId,
        a_addr: SocketAddr,
        b: PeerId,
        b_addr: SocketAddr,
        kind: ConnectionKind,
    ) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        (
            Self::from_parts(b, b_addr, kind, a_tx, a_rx),
            Self::from_parts(a, a_addr, kind, b_tx, b_rx),
        )
    }

    /// The remote peer this connection reaches
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self.kind, ConnectionKind::Relayed { .. })
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Send one frame; fails once either side has closed
    pub async fn send(&self, frame: Bytes) -> ConnectivityResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ConnectivityError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| ConnectivityError::ConnectionClosed)
    }

    /// Receive the next frame; `None` once the connection is closed
    pub async fn recv(&self) -> Option<Bytes> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        self.rx.lock().await.recv().await
    }

    /// Encode and send a protocol message as one frame
    pub async fn send_msg<T: Serialize>(&self, msg: &T) -> ConnectivityResult<()> {
        let bytes = encode(msg)?;
        self.send(Bytes::from(bytes)).await
    }

    /// Receive and decode one protocol message, bounded by `wait`
    pub async fn recv_msg<T: DeserializeOwned>(&self, wait: Duration) -> ConnectivityResult<T> {
        match timeout(wait, self.recv()).await {
            Ok(Some(frame)) => decode(&frame),
            Ok(None) => Err(ConnectivityError::ConnectionClosed),
            Err(_) => Err(ConnectivityError::Timeout),
        }
    }

    /// Stop using this connection locally; pending receives drain to `None`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer.to_hex())
            .field("remote_addr", &self.remote_addr)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The transport/stream-multiplexing host
#[async_trait]
pub trait Host: Send + Sync {
    /// Open a direct connection to `addr`
    async fn dial(&self, addr: SocketAddr) -> ConnectivityResult<Connection>;

    /// Addresses this node is currently reachable on
    fn listen_addresses(&self) -> Vec<SocketAddr>;
}

/// NAT reachability as reported by the external detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatStatus {
    Public,
    Private,
    #[default]
    Unknown,
}

/// External NAT status detector, polled periodically
#[async_trait]
pub trait NatDetector: Send + Sync {
    async fn current_status(&self) -> NatStatus;
}

/// Topic-based message bus, used only as a discovery transport
#[async_trait]
pub trait PubsubBus: Send + Sync {
    async fn publish(&self, topic: &str, data: Bytes) -> ConnectivityResult<()>;

    /// Subscribe to a topic; delivered messages arrive on the receiver
    async fn subscribe(&self, topic: &str) -> ConnectivityResult<mpsc::Receiver<Bytes>>;
}

/// Optional DHT routing collaborator
#[async_trait]
pub trait DhtRouter: Send + Sync {
    async fn find_peer(&self, peer: PeerId) -> ConnectivityResult<Vec<SocketAddr>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn pair_moves_frames_both_ways() {
        let (a, b) = Connection::pair(
            PeerId::random(),
            addr(1),
            PeerId::random(),
            addr(2),
            ConnectionKind::Direct,
        );

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.recv().await.unwrap().as_ref(), b"ping");

        b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(a.recv().await.unwrap().as_ref(), b"pong");
    }

    #[tokio::test]
    async fn close_stops_local_io() {
        let (a, b) = Connection::pair(
            PeerId::random(),
            addr(1),
            PeerId::random(),
            addr(2),
            ConnectionKind::Direct,
        );

        a.close();
        assert!(a.send(Bytes::from_static(b"x")).await.is_err());
        assert!(a.recv().await.is_none());
        drop(a);
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_msg_times_out() {
        let (a, _b) = Connection::pair(
            PeerId::random(),
            addr(1),
            PeerId::random(),
            addr(2),
            ConnectionKind::Direct,
        );
        let res: ConnectivityResult<crate::protocol::RelayMessage> =
            a.recv_msg(Duration::from_millis(20)).await;
        assert!(matches!(res, Err(ConnectivityError::Timeout)));
    }
}
