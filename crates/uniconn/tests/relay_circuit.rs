//! End-to-end relay flows: reservation, circuit, data transfer and the
//! hard circuit ceilings under concurrency.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use common::{addr, TestHost, TestNet};
use uniconn::{
    ConnectivityError, DenyReason, InboundRelayed, PeerId, RelayClient, RelayLimits, RelayServer,
};

const RELAY_ADDR_PORT: u16 = 7000;

fn relay_setup(limits: RelayLimits) -> (Arc<RelayServer>, Arc<TestNet>) {
    let server = RelayServer::new(PeerId::random(), limits);
    let net = Arc::new(TestNet::new().with_relay(addr(RELAY_ADDR_PORT), server.clone()));
    (server, net)
}

fn client_on(
    net: &Arc<TestNet>,
    port: u16,
) -> (
    Arc<RelayClient>,
    tokio::sync::mpsc::Receiver<InboundRelayed>,
    PeerId,
) {
    let peer = PeerId::random();
    let host = TestHost::new(peer, vec![addr(port)], net.clone());
    let (client, inbound) = RelayClient::new(
        peer,
        host,
        3,
        Duration::from_secs(60),
        Duration::from_secs(5),
    );
    (client, inbound, peer)
}

#[tokio::test]
async fn circuit_carries_data_both_ways() {
    let (server, net) = relay_setup(RelayLimits::default());
    let relay_id = server.local_peer();

    let (dst_client, mut dst_inbound, dst_peer) = client_on(&net, 7001);
    let (src_client, _src_inbound, src_peer) = client_on(&net, 7002);

    dst_client
        .reserve(relay_id, addr(RELAY_ADDR_PORT))
        .await
        .unwrap();
    assert_eq!(server.stats().await.active_reservations, 1);

    let src_conn = src_client
        .dial_via_relay(relay_id, addr(RELAY_ADDR_PORT), dst_peer)
        .await
        .unwrap();
    assert!(src_conn.is_relayed());
    assert_eq!(src_conn.peer(), dst_peer);

    let inbound = dst_inbound.recv().await.unwrap();
    assert_eq!(inbound.src, src_peer);
    assert_eq!(inbound.relay, relay_id);

    src_conn.send(Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(inbound.conn.recv().await.unwrap().as_ref(), b"hello");

    inbound.conn.send(Bytes::from_static(b"world")).await.unwrap();
    assert_eq!(src_conn.recv().await.unwrap().as_ref(), b"world");

    assert_eq!(server.stats().await.active_circuits, 1);
    assert!(server.stats().await.bytes_relayed >= 10);
}

#[tokio::test]
async fn circuit_to_unreserved_peer_is_denied() {
    let (server, net) = relay_setup(RelayLimits::default());
    let (src_client, _inbound, _src) = client_on(&net, 7010);

    let err = src_client
        .dial_via_relay(server.local_peer(), addr(RELAY_ADDR_PORT), PeerId::random())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConnectivityError::CircuitDenied(DenyReason::NoReservation)
    ));
}

#[tokio::test]
async fn second_circuit_over_the_ceiling_is_denied() {
    let limits = RelayLimits {
        max_circuits: 1,
        ..RelayLimits::default()
    };
    let (server, net) = relay_setup(limits);
    let relay_id = server.local_peer();

    let (dst_client, mut dst_inbound, dst_peer) = client_on(&net, 7020);
    dst_client
        .reserve(relay_id, addr(RELAY_ADDR_PORT))
        .await
        .unwrap();

    let (src_client, _si, _sp) = client_on(&net, 7021);
    let first = src_client
        .dial_via_relay(relay_id, addr(RELAY_ADDR_PORT), dst_peer)
        .await
        .unwrap();
    let _held = dst_inbound.recv().await.unwrap();

    let err = src_client
        .dial_via_relay(relay_id, addr(RELAY_ADDR_PORT), dst_peer)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConnectivityError::CircuitDenied(DenyReason::ResourceLimit)
    ));
    assert_eq!(server.stats().await.active_circuits, 1);
    drop(first);
}

#[tokio::test]
async fn concurrent_requests_never_exceed_the_ceiling() {
    let limits = RelayLimits {
        max_circuits: 4,
        max_circuits_per_peer: 32,
        ..RelayLimits::default()
    };
    let (server, net) = relay_setup(limits);
    let relay_id = server.local_peer();

    let (dst_client, mut dst_inbound, dst_peer) = client_on(&net, 7030);
    dst_client
        .reserve(relay_id, addr(RELAY_ADDR_PORT))
        .await
        .unwrap();

    // Keep inbound circuits alive on the destination side
    let drain = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(inbound) = dst_inbound.recv().await {
            held.push(inbound);
        }
        held
    });

    let mut attempts = Vec::new();
    for i in 0..16u16 {
        let (src_client, _inbound, _peer) = client_on(&net, 7100 + i);
        attempts.push(tokio::spawn(async move {
            let result = src_client
                .dial_via_relay(relay_id, addr(RELAY_ADDR_PORT), dst_peer)
                .await;
            // Hold the connection so granted circuits stay live
            (result, src_client)
        }));
    }

    let mut granted = Vec::new();
    let mut denied = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            (Ok(conn), client) => granted.push((conn, client)),
            (Err(ConnectivityError::CircuitDenied(DenyReason::ResourceLimit)), _) => denied += 1,
            (Err(other), _) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(granted.len(), 4);
    assert_eq!(denied, 12);
    assert_eq!(server.stats().await.active_circuits, 4);
    drain.abort();
}
