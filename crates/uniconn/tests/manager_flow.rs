//! The connect escalation ladder through the manager: relayed fallback,
//! background upgrades, and discovery feeding the peer list.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use common::{addr, TestHost, TestNet};
use uniconn::dcutr::DcutrCoordinator;
use uniconn::metrics::Metrics;
use uniconn::{
    Announcement, BootstrapPeer, Collaborators, ConnectivityConfig, ConnectivityError,
    ConnectivityManager, ConnectivityMetrics, ConnectivityResult, DenyReason, DiscoverySource,
    PeerFilter, PeerId, PubsubBus, RelayClient, RelayLimits, RelayServer,
};

const RELAY_PORT: u16 = 7300;
const UNREACHABLE_PORT: u16 = 7999;

fn ladder_config(relay: PeerId, enable_dcutr: bool) -> ConnectivityConfig {
    ConnectivityConfig {
        enable_mdns: false,
        enable_pubsub_discovery: false,
        enable_autonat: false,
        enable_dcutr,
        dial_timeout: Duration::from_millis(300),
        dcutr_timeout: Duration::from_millis(300),
        request_timeout: Duration::from_secs(5),
        bootstrap_peers: vec![BootstrapPeer {
            peer_id: relay,
            addr: addr(RELAY_PORT),
            relay_capable: true,
        }],
        ..Default::default()
    }
}

struct Ladder {
    manager: Arc<ConnectivityManager>,
    target: PeerId,
    target_inbound: mpsc::Receiver<uniconn::InboundRelayed>,
    net: Arc<TestNet>,
}

/// Relay at RELAY_PORT, target reserved on it, source manager whose only
/// stored address for the target is unreachable.
async fn ladder(enable_dcutr: bool, target_dialable: bool) -> Ladder {
    let server = RelayServer::new(PeerId::random(), RelayLimits::default());
    let relay = server.local_peer();

    let source = PeerId::random();
    let target = PeerId::random();

    let mut net = TestNet::new().with_relay(addr(RELAY_PORT), server);
    net = net.with_peer(addr(7301), source);
    if target_dialable {
        net = net.with_peer(addr(7302), target);
    }
    let net = Arc::new(net);

    let target_host = TestHost::new(target, vec![addr(7302)], net.clone());
    let (target_client, target_inbound) = RelayClient::new(
        target,
        target_host,
        3,
        Duration::from_secs(60),
        Duration::from_secs(5),
    );
    target_client.reserve(relay, addr(RELAY_PORT)).await.unwrap();

    let source_host = TestHost::new(source, vec![addr(7301)], net.clone());
    let manager = ConnectivityManager::new(
        source,
        ladder_config(relay, enable_dcutr),
        source_host,
        Collaborators::default(),
    )
    .unwrap();
    manager.start().await.unwrap();
    manager.add_peer(target, vec![addr(UNREACHABLE_PORT)]).await;

    Ladder {
        manager,
        target,
        target_inbound,
        net,
    }
}

async fn wait_for(
    manager: &Arc<ConnectivityManager>,
    check: impl Fn(&ConnectivityMetrics) -> bool,
) -> ConnectivityMetrics {
    for _ in 0..50 {
        let snap = manager.get_metrics();
        if check(&snap) {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached, metrics: {:?}", manager.get_metrics());
}

#[tokio::test]
async fn direct_failure_falls_back_to_relay() {
    let mut ladder = ladder(false, false).await;

    let conn = ladder.manager.connect(ladder.target).await.unwrap();
    assert!(conn.is_relayed());
    assert_eq!(conn.peer(), ladder.target);

    let snap = ladder.manager.get_metrics();
    assert_eq!(snap.relay_connections, 1);
    assert_eq!(snap.relay_connections_established, 1);
    assert_eq!(snap.direct_connections, 0);
    assert_eq!(snap.dcutr_attempts, 0);

    // Bytes flow end to end through the relay
    let inbound = ladder.target_inbound.recv().await.unwrap();
    conn.send(Bytes::from_static(b"over the relay")).await.unwrap();
    assert_eq!(inbound.conn.recv().await.unwrap().as_ref(), b"over the relay");

    ladder.manager.stop().await;
}

#[tokio::test]
async fn circuit_denial_is_surfaced_not_retried() {
    let server = RelayServer::new(PeerId::random(), RelayLimits::default());
    let relay = server.local_peer();
    let source = PeerId::random();
    let target = PeerId::random();

    let net = Arc::new(
        TestNet::new()
            .with_relay(addr(RELAY_PORT), server)
            .with_peer(addr(7301), source),
    );
    let host = TestHost::new(source, vec![addr(7301)], net);
    let manager = ConnectivityManager::new(
        source,
        ladder_config(relay, false),
        host,
        Collaborators::default(),
    )
    .unwrap();
    manager.start().await.unwrap();

    // The target never reserved on the relay, so the relay denies the circuit
    manager.add_peer(target, vec![addr(UNREACHABLE_PORT)]).await;

    let err = manager.connect(target).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectivityError::CircuitDenied(DenyReason::NoReservation)
    ));

    manager.stop().await;
}

#[tokio::test]
async fn relayed_connection_upgrades_in_the_background() {
    let mut ladder = ladder(true, true).await;

    // Target answers upgrade attempts on inbound relayed connections
    let target_net = ladder.net.clone();
    let target = ladder.target;
    let mut inbound_rx = std::mem::replace(&mut ladder.target_inbound, mpsc::channel(1).1);
    tokio::spawn(async move {
        let target_host = TestHost::new(target, vec![addr(7302)], target_net);
        let dcutr = DcutrCoordinator::new(
            target,
            target_host,
            Arc::new(Metrics::default()),
            Duration::from_secs(2),
            Duration::from_secs(60),
        );
        while let Some(inbound) = inbound_rx.recv().await {
            let _ = dcutr.respond(&inbound.conn).await;
        }
    });

    let conn = ladder.manager.connect(ladder.target).await.unwrap();
    assert!(conn.is_relayed());

    let snap = wait_for(&ladder.manager, |m| {
        m.dcutr_successes == 1 && m.direct_connections == 1
    })
    .await;
    assert_eq!(snap.relay_connections, 0);
    assert_eq!(snap.dcutr_attempts, 1);
    // The relayed handle was superseded and closed
    assert!(conn.is_closed());

    ladder.manager.stop().await;
}

#[tokio::test]
async fn failed_upgrade_keeps_the_relayed_connection() {
    let mut ladder = ladder(true, false).await;

    let conn = ladder.manager.connect(ladder.target).await.unwrap();
    assert!(conn.is_relayed());

    // Target never answers the upgrade exchange
    let _inbound = ladder.target_inbound.recv().await.unwrap();

    let snap = wait_for(&ladder.manager, |m| {
        m.dcutr_attempts == 1 && m.dcutr_successes == 0
    })
    .await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let snap_after = ladder.manager.get_metrics();
    assert_eq!(snap_after.relay_connections, 1);
    assert_eq!(snap_after.direct_connections, 0);
    assert!(snap.dcutr_successes <= snap.dcutr_attempts);
    assert!(!conn.is_closed());

    ladder.manager.stop().await;
}

/// Loopback bus delivering published messages to every subscriber
#[derive(Default)]
struct MemoryBus {
    subs: Mutex<HashMap<String, Vec<mpsc::Sender<Bytes>>>>,
}

#[async_trait]
impl PubsubBus for MemoryBus {
    async fn publish(&self, topic: &str, data: Bytes) -> ConnectivityResult<()> {
        if let Some(senders) = self.subs.lock().await.get(topic) {
            for tx in senders {
                let _ = tx.send(data.clone()).await;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> ConnectivityResult<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(32);
        self.subs
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[tokio::test]
async fn pubsub_announcements_reach_the_peer_list() {
    let bus = Arc::new(MemoryBus::default());
    let local = PeerId::random();
    let net = Arc::new(TestNet::new());
    let host = TestHost::new(local, vec![addr(7400)], net);

    let config = ConnectivityConfig {
        enable_mdns: false,
        enable_autonat: false,
        enable_relay_client: false,
        enable_dcutr: false,
        pubsub_announce_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let manager = ConnectivityManager::new(
        local,
        config.clone(),
        host,
        Collaborators {
            pubsub_bus: Some(bus.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    manager.start().await.unwrap();

    let remote = PeerId::random();
    let announcement = Announcement {
        peer: remote,
        addresses: vec![addr(7401)],
        relay_capable: true,
    };
    let bytes = Bytes::from(uniconn::protocol::encode(&announcement).unwrap());
    bus.publish(&config.pubsub_topics[0], bytes).await.unwrap();

    let snap = wait_for(&manager, |m| m.peers_discovered_pubsub == 1).await;
    assert_eq!(snap.peers_discovered_pubsub, 1);

    let peers = manager.list_known_peers(PeerFilter::All).await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, remote);
    assert_eq!(peers[0].source, DiscoverySource::Pubsub);
    assert!(peers[0].relay_capable);

    manager.stop().await;
}
