//! In-memory registry of known peers
//!
//! All mutation funnels through one owning task fed by an mpsc mailbox;
//! readers get cloned snapshots. Addresses are unioned across repeated
//! discoveries, other fields are last-write-wins.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::protocol::{DiscoverySource, PeerId};

/// A known remote peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addresses: Vec<SocketAddr>,
    pub source: DiscoverySource,
    pub relay_capable: bool,
    pub last_seen: Instant,
    pub connected: bool,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, addresses: Vec<SocketAddr>, source: DiscoverySource) -> Self {
        Self {
            peer_id,
            addresses,
            source,
            relay_capable: false,
            last_seen: Instant::now(),
            connected: false,
        }
    }

    pub fn with_relay_capable(mut self, relay_capable: bool) -> Self {
        self.relay_capable = relay_capable;
        self
    }
}

/// Snapshot filter for `list`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerFilter {
    #[default]
    All,
    Connected,
    RelayCapable,
    Source(DiscoverySource),
}

impl PeerFilter {
    fn matches(&self, record: &PeerRecord) -> bool {
        match self {
            PeerFilter::All => true,
            PeerFilter::Connected => record.connected,
            PeerFilter::RelayCapable => record.relay_capable,
            PeerFilter::Source(source) => record.source == *source,
        }
    }
}

enum Command {
    AddOrUpdate {
        record: PeerRecord,
        reply: oneshot::Sender<bool>,
    },
    SetConnected {
        peer: PeerId,
        connected: bool,
    },
    EvictStale {
        stale_after: Duration,
        reply: oneshot::Sender<usize>,
    },
    Get {
        peer: PeerId,
        reply: oneshot::Sender<Option<PeerRecord>>,
    },
    List {
        filter: PeerFilter,
        reply: oneshot::Sender<Vec<PeerRecord>>,
    },
}

/// Cloneable handle to the store's owner task
#[derive(Clone)]
pub struct PeerStore {
    tx: mpsc::Sender<Command>,
}

impl PeerStore {
    /// Start the owner task
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Merge a discovery into the registry; `true` if the peer was new.
    ///
    /// Records with no addresses are dropped: a stored record always has at
    /// least one address.
    pub async fn add_or_update(&self, record: PeerRecord) -> ConnectivityResult<bool> {
        if record.addresses.is_empty() {
            trace!(peer = %record.peer_id, "ignoring discovery with no addresses");
            return Ok(false);
        }
        self.request(|reply| Command::AddOrUpdate { record, reply })
            .await
    }

    /// Flag a peer as connected/disconnected (exempts it from eviction)
    pub async fn set_connected(&self, peer: PeerId, connected: bool) {
        let _ = self.tx.send(Command::SetConnected { peer, connected }).await;
    }

    /// Drop unconnected records not seen within `stale_after`
    pub async fn evict_stale(&self, stale_after: Duration) -> ConnectivityResult<usize> {
        self.request(|reply| Command::EvictStale { stale_after, reply })
            .await
    }

    pub async fn get(&self, peer: PeerId) -> ConnectivityResult<Option<PeerRecord>> {
        self.request(|reply| Command::Get { peer, reply }).await
    }

    /// Immutable snapshot of matching records
    pub async fn list(&self, filter: PeerFilter) -> ConnectivityResult<Vec<PeerRecord>> {
        self.request(|reply| Command::List { filter, reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> ConnectivityResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ConnectivityError::Shutdown)?;
        rx.await.map_err(|_| ConnectivityError::Shutdown)
    }
}

async fn run(mut rx: mpsc::Receiver<Command>) {
    let mut records: HashMap<PeerId, PeerRecord> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::AddOrUpdate { record, reply } => {
                let is_new = merge(&mut records, record);
                let _ = reply.send(is_new);
            }
            Command::SetConnected { peer, connected } => {
                if let Some(existing) = records.get_mut(&peer) {
                    existing.connected = connected;
                    if connected {
                        existing.last_seen = Instant::now();
                    }
                }
            }
            Command::EvictStale { stale_after, reply } => {
                let now = Instant::now();
                let before = records.len();
                records.retain(|_, r| r.connected || now.duration_since(r.last_seen) < stale_after);
                let evicted = before - records.len();
                if evicted > 0 {
                    debug!(evicted, "evicted stale peer records");
                }
                let _ = reply.send(evicted);
            }
            Command::Get { peer, reply } => {
                let _ = reply.send(records.get(&peer).cloned());
            }
            Command::List { filter, reply } => {
                let snapshot = records
                    .values()
                    .filter(|r| filter.matches(r))
                    .cloned()
                    .collect();
                let _ = reply.send(snapshot);
            }
        }
    }
}

fn merge(records: &mut HashMap<PeerId, PeerRecord>, incoming: PeerRecord) -> bool {
    match records.get_mut(&incoming.peer_id) {
        Some(existing) => {
            for addr in incoming.addresses {
                if !existing.addresses.contains(&addr) {
                    existing.addresses.push(addr);
                }
            }
            existing.source = incoming.source;
            existing.relay_capable |= incoming.relay_capable;
            existing.last_seen = incoming.last_seen;
            false
        }
        None => {
            trace!(peer = %incoming.peer_id, source = %incoming.source, "new peer record");
            records.insert(incoming.peer_id, incoming);
            true
        }
    }
}
