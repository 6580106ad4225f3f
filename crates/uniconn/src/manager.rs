//! Connectivity manager
//!
//! Ties the subsystems together: discovery services feed one channel into
//! the peer store, `connect` walks the escalation ladder (direct dial,
//! relayed circuit, background hole-punch upgrade), and background loops
//! keep NAT status, reservations and the store current.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::config::ConnectivityConfig;
use crate::dcutr::DcutrCoordinator;
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::mdns::MdnsDiscovery;
use crate::metrics::{ConnectivityMetrics, Metrics};
use crate::peer_store::{PeerFilter, PeerRecord, PeerStore};
use crate::protocol::{DiscoverySource, PeerId};
use crate::pubsub::PubsubDiscovery;
use crate::relay::client::{InboundRelayed, RelayClient};
use crate::relay::server::{RelayLimits, RelayServer};
use crate::transport::{Connection, DhtRouter, Host, NatDetector, PubsubBus};

/// Optional external collaborators the manager can use when present
#[derive(Default)]
pub struct Collaborators {
    pub nat_detector: Option<Arc<dyn NatDetector>>,
    pub pubsub_bus: Option<Arc<dyn PubsubBus>>,
    pub dht_router: Option<Arc<dyn DhtRouter>>,
}

pub struct ConnectivityManager {
    local_peer: PeerId,
    config: ConnectivityConfig,
    host: Arc<dyn Host>,
    nat_detector: Option<Arc<dyn NatDetector>>,
    pubsub_bus: Option<Arc<dyn PubsubBus>>,
    dht_router: Option<Arc<dyn DhtRouter>>,

    store: PeerStore,
    metrics: Arc<Metrics>,
    relay_client: Option<Arc<RelayClient>>,
    relay_server: Option<Arc<RelayServer>>,
    dcutr: Option<Arc<DcutrCoordinator>>,

    connections: Arc<RwLock<HashMap<PeerId, Arc<Connection>>>>,
    dials_in_flight: Mutex<HashSet<PeerId>>,

    discovery_tx: mpsc::Sender<PeerRecord>,
    discovery_rx: Mutex<Option<mpsc::Receiver<PeerRecord>>>,
    inbound_relayed_rx: Mutex<Option<mpsc::Receiver<InboundRelayed>>>,

    mdns: Mutex<Option<Arc<MdnsDiscovery>>>,
    pubsub: Mutex<Option<Arc<PubsubDiscovery>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
    started: AtomicBool,
}

impl ConnectivityManager {
    pub fn new(
        local_peer: PeerId,
        config: ConnectivityConfig,
        host: Arc<dyn Host>,
        collaborators: Collaborators,
    ) -> ConnectivityResult<Arc<Self>> {
        config
            .validate()
            .map_err(ConnectivityError::Protocol)?;

        let metrics = Arc::new(Metrics::default());
        let store = PeerStore::spawn();
        let (discovery_tx, discovery_rx) = mpsc::channel(256);

        let (relay_client, inbound_rx) = if config.enable_relay_client {
            let (client, rx) = RelayClient::new(
                local_peer,
                host.clone(),
                config.max_relay_reservations,
                config.reservation_renew_margin,
                config.request_timeout,
            );
            (Some(client), Some(rx))
        } else {
            (None, None)
        };

        let relay_server = config.enable_relay_server.then(|| {
            RelayServer::new(
                local_peer,
                RelayLimits {
                    max_circuits: config.max_relay_circuits,
                    max_circuits_per_peer: config.max_circuits_per_peer,
                    reservation_ttl: config.reservation_ttl,
                    ack_timeout: config.request_timeout,
                    ..RelayLimits::default()
                },
            )
        });

        let dcutr = config.enable_dcutr.then(|| {
            DcutrCoordinator::new(
                local_peer,
                host.clone(),
                metrics.clone(),
                config.dcutr_timeout,
                config.dcutr_cooldown,
            )
        });

        Ok(Arc::new(Self {
            local_peer,
            config,
            host,
            nat_detector: collaborators.nat_detector,
            pubsub_bus: collaborators.pubsub_bus,
            dht_router: collaborators.dht_router,
            store,
            metrics,
            relay_client,
            relay_server,
            dcutr,
            connections: Arc::new(RwLock::new(HashMap::new())),
            dials_in_flight: Mutex::new(HashSet::new()),
            discovery_tx,
            discovery_rx: Mutex::new(Some(discovery_rx)),
            inbound_relayed_rx: Mutex::new(inbound_rx),
            mdns: Mutex::new(None),
            pubsub: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
        }))
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// The embedded relay server, when this node serves relay traffic
    pub fn relay_server(&self) -> Option<Arc<RelayServer>> {
        self.relay_server.clone()
    }

    pub fn get_metrics(&self) -> ConnectivityMetrics {
        self.metrics.snapshot()
    }

    pub async fn list_known_peers(&self, filter: PeerFilter) -> ConnectivityResult<Vec<PeerRecord>> {
        self.store.list(filter).await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Start every enabled service and the background loops
    pub async fn start(self: &Arc<Self>) -> ConnectivityResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(peer = %self.local_peer, "connectivity manager starting");

        self.spawn_discovery_fan_in().await;

        if self.config.enable_mdns {
            let mdns = Arc::new(MdnsDiscovery::new(
                self.local_peer,
                self.host.clone(),
                self.config.mdns_service_name.clone(),
                self.config.mdns_port,
                self.config.mdns_query_interval,
                self.config.enable_relay_server,
                self.discovery_tx.clone(),
            ));
            mdns.clone().start();
            *self.mdns.lock().await = Some(mdns);
        }

        if self.config.enable_pubsub_discovery {
            match &self.pubsub_bus {
                Some(bus) => {
                    let pubsub = Arc::new(PubsubDiscovery::new(
                        self.local_peer,
                        self.host.clone(),
                        bus.clone(),
                        self.config.pubsub_topics.clone(),
                        self.config.pubsub_announce_interval,
                        self.config.pubsub_dedup_window,
                        self.config.pubsub_listen_only,
                        self.config.enable_relay_server,
                        self.discovery_tx.clone(),
                    ));
                    pubsub.start().await?;
                    *self.pubsub.lock().await = Some(pubsub);
                }
                None => warn!("pubsub discovery enabled but no bus was provided"),
            }
        }

        if self.config.enable_autonat {
            if let Some(detector) = &self.nat_detector {
                self.spawn_autonat_loop(detector.clone()).await;
            }
        }

        if let Some(server) = &self.relay_server {
            server.spawn_sweeper(self.config.eviction_interval);
        }

        self.spawn_eviction_loop().await;
        self.spawn_inbound_relayed_handler().await;
        self.bootstrap().await;
        Ok(())
    }

    /// Connect to `peer`: direct dial first, relayed circuit as fallback,
    /// then a background upgrade attempt on relayed connections.
    pub async fn connect(self: &Arc<Self>, peer: PeerId) -> ConnectivityResult<Arc<Connection>> {
        if peer == self.local_peer {
            return Err(ConnectivityError::DialFailed("cannot dial self".into()));
        }
        if let Some(existing) = self.live_connection(peer).await {
            return Ok(existing);
        }
        if self.connections.read().await.len() >= self.config.max_connections {
            return Err(ConnectivityError::DialFailed(
                "connection limit reached".into(),
            ));
        }
        if !self.dials_in_flight.lock().await.insert(peer) {
            return Err(ConnectivityError::DialFailed(format!(
                "dial to {} already in flight",
                peer
            )));
        }

        let result = self.connect_inner(peer).await;
        self.dials_in_flight.lock().await.remove(&peer);

        if result.is_err() {
            self.metrics.record_connection_failed();
        }
        result
    }

    async fn connect_inner(self: &Arc<Self>, peer: PeerId) -> ConnectivityResult<Arc<Connection>> {
        let addresses = self.resolve_addresses(peer).await?;

        for addr in &addresses {
            match timeout(self.config.dial_timeout, self.host.dial(*addr)).await {
                Ok(Ok(conn)) if conn.peer() == peer => {
                    debug!(peer = %peer, addr = %addr, "direct dial succeeded");
                    self.metrics.record_direct_connection();
                    return Ok(self.adopt_connection(peer, conn).await);
                }
                Ok(Ok(conn)) => {
                    debug!(peer = %peer, addr = %addr, got = %conn.peer(), "dialed address answered as a different peer");
                    conn.close();
                }
                Ok(Err(e)) => debug!(peer = %peer, addr = %addr, "direct dial failed: {}", e),
                Err(_) => debug!(peer = %peer, addr = %addr, "direct dial timed out"),
            }
        }

        let Some(client) = &self.relay_client else {
            return Err(ConnectivityError::DialFailed(format!(
                "no direct path to {} and relay client disabled",
                peer
            )));
        };

        let relays = self.relay_candidates().await;
        if relays.is_empty() {
            return Err(ConnectivityError::NoRelayAvailable);
        }
        for (relay, relay_addr) in relays {
            match client.dial_via_relay(relay, relay_addr, peer).await {
                Ok(conn) => {
                    info!(peer = %peer, relay = %relay, "connected through relay");
                    self.metrics.record_relay_connection();
                    let conn = self.adopt_connection(peer, conn).await;
                    self.spawn_upgrade_attempt(peer, conn.clone());
                    return Ok(conn);
                }
                // An explicit denial is surfaced as-is; only transport
                // failures move on to the next relay.
                Err(e @ ConnectivityError::CircuitDenied(_)) => {
                    debug!(peer = %peer, relay = %relay, "circuit denied: {}", e);
                    return Err(e);
                }
                Err(e) => debug!(peer = %peer, relay = %relay, "relayed dial failed: {}", e),
            }
        }
        Err(ConnectivityError::DialFailed(format!(
            "every relay dial to {} failed",
            peer
        )))
    }

    /// Drop the connection to `peer`, if any
    pub async fn disconnect(&self, peer: PeerId) {
        if let Some(conn) = self.connections.write().await.remove(&peer) {
            conn.close();
            self.metrics.record_connection_closed(conn.is_relayed());
            self.store.set_connected(peer, false).await;
        }
    }

    /// Manually register a peer (source `Manual`)
    pub async fn add_peer(&self, peer: PeerId, addresses: Vec<std::net::SocketAddr>) {
        let record = PeerRecord::new(peer, addresses, DiscoverySource::Manual);
        self.handle_discovery(record).await;
    }

    /// Stop services, close connections, tear down background tasks
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        if let Some(mdns) = self.mdns.lock().await.take() {
            mdns.stop();
        }
        if let Some(pubsub) = self.pubsub.lock().await.take() {
            pubsub.stop();
        }
        if let Some(client) = &self.relay_client {
            client.stop().await;
        }
        if let Some(server) = &self.relay_server {
            server.stop().await;
        }

        for (_, conn) in self.connections.write().await.drain() {
            self.metrics.record_connection_closed(conn.is_relayed());
            conn.close();
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("connectivity manager stopped");
    }

    async fn live_connection(&self, peer: PeerId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        match connections.get(&peer) {
            Some(conn) if !conn.is_closed() => Some(conn.clone()),
            Some(_) => {
                connections.remove(&peer);
                None
            }
            None => None,
        }
    }

    async fn resolve_addresses(
        &self,
        peer: PeerId,
    ) -> ConnectivityResult<Vec<std::net::SocketAddr>> {
        if let Some(record) = self.store.get(peer).await? {
            return Ok(record.addresses);
        }

        if self.config.enable_dht_discovery {
            if let Some(dht) = &self.dht_router {
                let addresses = dht.find_peer(peer).await.unwrap_or_default();
                if !addresses.is_empty() {
                    debug!(peer = %peer, count = addresses.len(), "addresses resolved via DHT");
                    self.handle_discovery(PeerRecord::new(
                        peer,
                        addresses.clone(),
                        DiscoverySource::Dht,
                    ))
                    .await;
                    return Ok(addresses);
                }
            }
        }
        Err(ConnectivityError::PeerNotFound(peer))
    }

    /// Relays worth trying for an outbound circuit: bootstrap relays plus
    /// every relay-capable peer the store knows about.
    async fn relay_candidates(&self) -> Vec<(PeerId, std::net::SocketAddr)> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for bp in &self.config.bootstrap_peers {
            if bp.relay_capable && bp.peer_id != self.local_peer && seen.insert(bp.peer_id) {
                candidates.push((bp.peer_id, bp.addr));
            }
        }
        if let Ok(records) = self.store.list(PeerFilter::RelayCapable).await {
            for record in records {
                if record.peer_id == self.local_peer || !seen.insert(record.peer_id) {
                    continue;
                }
                if let Some(addr) = record.addresses.first() {
                    candidates.push((record.peer_id, *addr));
                }
            }
        }
        candidates
    }

    async fn adopt_connection(&self, peer: PeerId, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        if let Some(previous) = self
            .connections
            .write()
            .await
            .insert(peer, conn.clone())
        {
            previous.close();
        }
        self.store.set_connected(peer, true).await;
        if let Some(cb) = &self.config.on_connection_established {
            cb(&conn);
        }
        conn
    }

    /// Non-blocking relay-to-direct upgrade; failure leaves the relayed
    /// connection untouched.
    fn spawn_upgrade_attempt(self: &Arc<Self>, peer: PeerId, relayed: Arc<Connection>) {
        let Some(dcutr) = self.dcutr.clone() else {
            return;
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match dcutr.initiate(&relayed).await {
                Ok(direct) => {
                    manager.metrics.record_upgrade();
                    manager.adopt_connection(peer, direct).await;
                }
                Err(e) => debug!(peer = %peer, "upgrade attempt failed: {}", e),
            }
        });
    }

    async fn handle_discovery(&self, record: PeerRecord) {
        let source = record.source;
        match self.store.add_or_update(record.clone()).await {
            Ok(true) => {
                self.metrics.record_discovered(source);
                if let Some(cb) = &self.config.on_peer_discovered {
                    cb(&record);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("peer store rejected discovery: {}", e),
        }
    }

    async fn spawn_discovery_fan_in(self: &Arc<Self>) {
        let Some(mut rx) = self.discovery_rx.lock().await.take() else {
            return;
        };
        let manager = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                manager.handle_discovery(record).await;
            }
        }))
        .await;
    }

    async fn spawn_autonat_loop(self: &Arc<Self>, detector: Arc<dyn NatDetector>) {
        let manager = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            let mut ticker = interval(manager.config.autonat_query_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = detector.current_status().await;
                        if status != manager.metrics.nat_status() {
                            info!(?status, "NAT status changed");
                        }
                        manager.metrics.set_nat_status(status);
                    }
                    _ = manager.shutdown.notified() => return,
                }
            }
        }))
        .await;
    }

    async fn spawn_eviction_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            let mut ticker = interval(manager.config.eviction_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = manager.store.evict_stale(manager.config.peer_stale_after).await;
                    }
                    _ = manager.shutdown.notified() => return,
                }
            }
        }))
        .await;
    }

    /// Adopt circuits other peers open to us through our reserved relays
    async fn spawn_inbound_relayed_handler(self: &Arc<Self>) {
        let Some(mut rx) = self.inbound_relayed_rx.lock().await.take() else {
            return;
        };
        let manager = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            while let Some(InboundRelayed { src, relay, conn }) = rx.recv().await {
                debug!(src = %src, relay = %relay, "adopting inbound relayed connection");
                manager.metrics.record_relay_connection();
                let conn = manager.adopt_connection(src, conn).await;

                // The remote side initiates the upgrade; we answer it.
                if let Some(dcutr) = manager.dcutr.clone() {
                    let responder = Arc::clone(&manager);
                    tokio::spawn(async move {
                        match dcutr.respond(&conn).await {
                            Ok(direct) => {
                                responder.metrics.record_upgrade();
                                responder.adopt_connection(src, direct).await;
                            }
                            Err(e) => debug!(src = %src, "upgrade response failed: {}", e),
                        }
                    });
                }
            }
        }))
        .await;
    }

    /// Seed the store from the configured bootstrap peers and top up relay
    /// reservations.
    async fn bootstrap(self: &Arc<Self>) {
        for bp in &self.config.bootstrap_peers {
            let record = PeerRecord::new(bp.peer_id, vec![bp.addr], DiscoverySource::Bootstrap)
                .with_relay_capable(bp.relay_capable);
            self.handle_discovery(record).await;
        }

        let Some(client) = self.relay_client.clone() else {
            return;
        };
        let manager = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            let mut ticker = interval(manager.config.eviction_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let candidates = manager.relay_candidates().await;
                        client.ensure_reservations(&candidates).await;
                    }
                    _ = manager.shutdown.notified() => return,
                }
            }
        }))
        .await;
    }

    async fn push_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }
}
