//! Multicast local-network discovery
//!
//! Periodically multicasts a service query and answers queries for our
//! service name with a self-announcement. Responses from other peers are
//! forwarded to the discovery fan-in channel. Runs as a single task over
//! the v4 multicast socket plus an optional v6 one; a failed bind or group
//! join logs once and leaves the service inert rather than failing startup.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use crate::peer_store::PeerRecord;
use crate::protocol::{self, Announcement, DiscoverySource, MdnsMessage, PeerId};
use crate::transport::Host;

/// Well-known mDNS multicast groups
const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Repeated responses from the same peer within this window are dropped
const DEDUP_WINDOW: Duration = Duration::from_secs(5);

const MAX_PACKET: usize = 2048;

pub struct MdnsDiscovery {
    local_peer: PeerId,
    host: Arc<dyn Host>,
    service: String,
    port: u16,
    query_interval: Duration,
    relay_capable: bool,
    events: mpsc::Sender<PeerRecord>,
    shutdown: Arc<Notify>,
}

impl MdnsDiscovery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        host: Arc<dyn Host>,
        service: String,
        port: u16,
        query_interval: Duration,
        relay_capable: bool,
        events: mpsc::Sender<PeerRecord>,
    ) -> Self {
        Self {
            local_peer,
            host,
            service,
            port,
            query_interval,
            relay_capable,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Spawn the query/respond loop. Returns immediately; socket errors
    /// during setup disable the service instead of propagating.
    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            let v4 = match self.bind_v4().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("mDNS disabled, multicast setup failed: {}", e);
                    return;
                }
            };
            // v6 is best effort; plenty of networks only route the v4 group
            let v6 = match self.bind_v6().await {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("IPv6 multicast unavailable, continuing v4-only: {}", e);
                    None
                }
            };
            info!(service = %self.service, port = self.port, "mDNS discovery started");
            self.run(v4, v6).await;
        });
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    async fn bind_v4(&self) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port)).await?;
        socket.join_multicast_v4(MDNS_GROUP_V4, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(false)?;
        Ok(socket)
    }

    async fn bind_v6(&self) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind(("::", self.port)).await?;
        socket.join_multicast_v6(&MDNS_GROUP_V6, 0)?;
        socket.set_multicast_loop_v6(false)?;
        Ok(socket)
    }

    async fn run(&self, v4: UdpSocket, v6: Option<UdpSocket>) {
        let group_v4: SocketAddr = (MDNS_GROUP_V4, self.port).into();
        let group_v6: SocketAddr = (MDNS_GROUP_V6, self.port).into();
        let mut state = MdnsState::new(
            self.local_peer,
            self.service.clone(),
            self.events.clone(),
        );
        let mut query_timer = interval(self.query_interval);
        let mut buf_v4 = [0u8; MAX_PACKET];
        let mut buf_v6 = [0u8; MAX_PACKET];

        loop {
            tokio::select! {
                _ = query_timer.tick() => {
                    match protocol::encode(&MdnsMessage::Query { service: self.service.clone() }) {
                        Ok(bytes) => {
                            if let Err(e) = v4.send_to(&bytes, group_v4).await {
                                debug!("mDNS query send failed: {}", e);
                            }
                            if let Some(v6) = &v6 {
                                if let Err(e) = v6.send_to(&bytes, group_v6).await {
                                    debug!("mDNS v6 query send failed: {}", e);
                                }
                            }
                        }
                        Err(e) => warn!("mDNS query encode failed: {}", e),
                    }
                }
                recv = v4.recv_from(&mut buf_v4) => {
                    self.handle_recv(&mut state, &v4, recv, &buf_v4).await;
                }
                recv = recv_v6(&v6, &mut buf_v6) => {
                    if let Some(v6) = &v6 {
                        self.handle_recv(&mut state, v6, recv, &buf_v6).await;
                    }
                }
                _ = self.shutdown.notified() => {
                    debug!("mDNS discovery stopping");
                    return;
                }
            }
        }
    }

    async fn handle_recv(
        &self,
        state: &mut MdnsState,
        socket: &UdpSocket,
        recv: std::io::Result<(usize, SocketAddr)>,
        buf: &[u8],
    ) {
        let (len, src) = match recv {
            Ok(pair) => pair,
            Err(e) => {
                debug!("mDNS receive failed: {}", e);
                return;
            }
        };
        if let Some(reply) = state
            .handle_packet(&buf[..len], src, || self.announcement())
            .await
        {
            if let Err(e) = socket.send_to(&reply, src).await {
                debug!("mDNS response send failed: {}", e);
            }
        }
    }

    fn announcement(&self) -> Announcement {
        Announcement {
            peer: self.local_peer,
            addresses: self.host.listen_addresses(),
            relay_capable: self.relay_capable,
        }
    }
}

async fn recv_v6(
    socket: &Option<UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(s) => s.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Packet handling, separated from the socket loop
struct MdnsState {
    local_peer: PeerId,
    service: String,
    events: mpsc::Sender<PeerRecord>,
    last_seen: HashMap<(PeerId, SocketAddr), Instant>,
}

impl MdnsState {
    fn new(local_peer: PeerId, service: String, events: mpsc::Sender<PeerRecord>) -> Self {
        Self {
            local_peer,
            service,
            events,
            last_seen: HashMap::new(),
        }
    }

    /// Process one datagram; a `Some` return is a reply to send back to `src`.
    async fn handle_packet(
        &mut self,
        data: &[u8],
        src: SocketAddr,
        announce: impl FnOnce() -> Announcement,
    ) -> Option<Vec<u8>> {
        let msg: MdnsMessage = match protocol::decode(data) {
            Ok(msg) => msg,
            Err(_) => {
                trace!(%src, "dropping malformed mDNS packet");
                return None;
            }
        };

        match msg {
            MdnsMessage::Query { service } if service == self.service => {
                let response = MdnsMessage::Response {
                    service,
                    announcement: announce(),
                };
                protocol::encode(&response).ok()
            }
            MdnsMessage::Query { service } => {
                trace!(%service, "ignoring query for foreign service");
                None
            }
            MdnsMessage::Response {
                service,
                announcement,
            } => {
                if service == self.service {
                    self.handle_response(announcement, src).await;
                }
                None
            }
        }
    }

    async fn handle_response(&mut self, announcement: Announcement, src: SocketAddr) {
        if announcement.peer == self.local_peer {
            return;
        }
        let now = Instant::now();
        let key = (announcement.peer, src);
        if let Some(seen) = self.last_seen.get(&key) {
            if now.duration_since(*seen) < DEDUP_WINDOW {
                return;
            }
        }
        self.last_seen.insert(key, now);
        self.last_seen
            .retain(|_, at| now.duration_since(*at) < DEDUP_WINDOW * 4);

        // Only the announced transport addresses are dialable; the datagram
        // source is the mDNS socket, not a listen address.
        if announcement.addresses.is_empty() {
            trace!(peer = %announcement.peer, "announcement carries no addresses");
            return;
        }

        let record = PeerRecord::new(
            announcement.peer,
            announcement.addresses,
            DiscoverySource::Mdns,
        )
        .with_relay_capable(announcement.relay_capable);
        debug!(peer = %record.peer_id, "peer found via mDNS");
        let _ = self.events.send(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.1.7:{port}").parse().unwrap()
    }

    fn state(service: &str) -> (MdnsState, mpsc::Receiver<PeerRecord>, PeerId) {
        let local = PeerId::random();
        let (tx, rx) = mpsc::channel(8);
        (MdnsState::new(local, service.to_string(), tx), rx, local)
    }

    fn announcement(peer: PeerId) -> Announcement {
        Announcement {
            peer,
            addresses: vec![addr(9000)],
            relay_capable: false,
        }
    }

    #[tokio::test]
    async fn answers_query_for_own_service_only() {
        let (mut state, _rx, local) = state("svc.local");

        let query = protocol::encode(&MdnsMessage::Query {
            service: "svc.local".into(),
        })
        .unwrap();
        let reply = state
            .handle_packet(&query, addr(1), || announcement(local))
            .await
            .unwrap();
        match protocol::decode::<MdnsMessage>(&reply).unwrap() {
            MdnsMessage::Response { announcement, .. } => assert_eq!(announcement.peer, local),
            other => panic!("wrong reply: {:?}", other),
        }

        let foreign = protocol::encode(&MdnsMessage::Query {
            service: "other.local".into(),
        })
        .unwrap();
        assert!(state
            .handle_packet(&foreign, addr(1), || announcement(local))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn responses_feed_discovery_and_dedup() {
        let (mut state, mut rx, local) = state("svc.local");
        let remote = PeerId::random();
        let response = protocol::encode(&MdnsMessage::Response {
            service: "svc.local".into(),
            announcement: announcement(remote),
        })
        .unwrap();

        let reply = state
            .handle_packet(&response, addr(2), || announcement(local))
            .await;
        assert!(reply.is_none());
        let record = rx.recv().await.unwrap();
        assert_eq!(record.peer_id, remote);
        assert_eq!(record.source, DiscoverySource::Mdns);
        // Only the announced listen addresses, never the datagram source
        assert_eq!(record.addresses, vec![addr(9000)]);

        // Same peer and address again inside the dedup window: no event
        let reply = state
            .handle_packet(&response, addr(2), || announcement(local))
            .await;
        assert!(reply.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn own_announcements_and_garbage_are_ignored() {
        let (mut state, mut rx, local) = state("svc.local");

        let own = protocol::encode(&MdnsMessage::Response {
            service: "svc.local".into(),
            announcement: announcement(local),
        })
        .unwrap();
        let reply = state
            .handle_packet(&own, addr(3), || announcement(local))
            .await;
        assert!(reply.is_none());
        assert!(rx.try_recv().is_err());

        assert!(state
            .handle_packet(&[0xde, 0xad, 0xbe, 0xef], addr(3), || announcement(local))
            .await
            .is_none());
        assert!(rx.try_recv().is_err());
    }
}
