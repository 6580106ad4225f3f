//! Shared test fixtures: an in-memory network of hosts, relays and
//! directly dialable peers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use uniconn::{
    Connection, ConnectionKind, ConnectivityError, ConnectivityResult, Host, PeerId, RelayServer,
};

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Routing table shared by every host in a test
#[derive(Default)]
pub struct TestNet {
    relays: HashMap<SocketAddr, Arc<RelayServer>>,
    peers: HashMap<SocketAddr, PeerId>,
}

impl TestNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relay(mut self, at: SocketAddr, server: Arc<RelayServer>) -> Self {
        self.relays.insert(at, server);
        self
    }

    pub fn with_peer(mut self, at: SocketAddr, peer: PeerId) -> Self {
        self.peers.insert(at, peer);
        self
    }
}

/// A host wired into a [`TestNet`]. Dials to a relay address hand the far
/// half to that relay's server; dials to a peer address succeed with an
/// in-memory pair; everything else fails.
pub struct TestHost {
    pub local: PeerId,
    pub listen: Vec<SocketAddr>,
    net: Arc<TestNet>,
    /// Far halves of successful direct dials, kept alive for the test
    pub accepted: Mutex<Vec<Connection>>,
}

impl TestHost {
    pub fn new(local: PeerId, listen: Vec<SocketAddr>, net: Arc<TestNet>) -> Arc<Self> {
        Arc::new(Self {
            local,
            listen,
            net,
            accepted: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Host for TestHost {
    async fn dial(&self, target: SocketAddr) -> ConnectivityResult<Connection> {
        let from = self.listen.first().copied().unwrap_or_else(|| addr(0));

        if let Some(server) = self.net.relays.get(&target) {
            let (near, far) = Connection::pair(
                self.local,
                from,
                server.local_peer(),
                target,
                ConnectionKind::Direct,
            );
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.serve_connection(far).await;
            });
            return Ok(near);
        }

        if let Some(peer) = self.net.peers.get(&target) {
            let (near, far) = Connection::pair(
                self.local,
                from,
                *peer,
                target,
                ConnectionKind::Direct,
            );
            self.accepted.lock().await.push(far);
            return Ok(near);
        }

        Err(ConnectivityError::DialFailed(format!(
            "no route to {}",
            target
        )))
    }

    fn listen_addresses(&self) -> Vec<SocketAddr> {
        self.listen.clone()
    }
}
