//! Circuit relay server
//!
//! Accepts reservations and circuit requests from remote peers over framed
//! control connections and forwards circuit bytes bidirectionally. Limits
//! are hard ceilings checked synchronously at accept time; nothing queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tracing::{debug, info, trace, warn};

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::protocol::{encode, CircuitId, DenyReason, PeerId, RelayMessage};
use crate::transport::Connection;

use super::{Circuit, CircuitState};

/// Frames queued per circuit before the forwarder applies backpressure
const CIRCUIT_QUEUE_DEPTH: usize = 32;

/// Hard ceilings and policy knobs for the relay server
#[derive(Debug, Clone)]
pub struct RelayLimits {
    /// Reservations held concurrently
    pub max_reservations: usize,
    /// Live circuits overall
    pub max_circuits: usize,
    /// Live circuits touching any single peer (as source or destination)
    pub max_circuits_per_peer: usize,
    /// Granted reservation lifetime
    pub reservation_ttl: Duration,
    /// Reservation attempts allowed per peer within the rate window
    pub reservation_rate_max: usize,
    pub reservation_rate_window: Duration,
    /// Circuits with no data for this long are torn down
    pub circuit_idle_timeout: Duration,
    /// How long the destination gets to acknowledge a circuit
    pub ack_timeout: Duration,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_reservations: 128,
            max_circuits: 128,
            max_circuits_per_peer: 8,
            reservation_ttl: Duration::from_secs(300),
            reservation_rate_max: 8,
            reservation_rate_window: Duration::from_secs(30),
            circuit_idle_timeout: Duration::from_secs(120),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Server counters
#[derive(Debug, Clone, Default)]
pub struct RelayServerStats {
    pub active_reservations: usize,
    pub active_circuits: usize,
    pub bytes_relayed: u64,
}

struct ServerReservation {
    conn: Arc<Connection>,
    expires_at: Instant,
}

struct ServerCircuit {
    circuit: Circuit,
    /// Queue into the circuit's forwarding task
    pump_tx: mpsc::Sender<(PeerId, Vec<u8>)>,
    last_activity: Instant,
}

#[derive(Default)]
struct ServerState {
    reservations: HashMap<PeerId, ServerReservation>,
    circuits: HashMap<CircuitId, ServerCircuit>,
    /// Destination acks routed back to the requesting side's task
    pending_acks: HashMap<CircuitId, oneshot::Sender<bool>>,
    /// Recent reservation attempts per peer, pruned to the rate window
    recent_reserves: HashMap<PeerId, Vec<Instant>>,
    bytes_relayed: u64,
}

/// The relay server. One instance serves many control connections; the
/// embedding host spawns [`RelayServer::serve_connection`] per inbound
/// connection.
pub struct RelayServer {
    local_peer: PeerId,
    limits: RelayLimits,
    state: Arc<RwLock<ServerState>>,
    shutdown: Arc<Notify>,
}

impl RelayServer {
    pub fn new(local_peer: PeerId, limits: RelayLimits) -> Arc<Self> {
        Arc::new(Self {
            local_peer,
            limits,
            state: Arc::new(RwLock::new(ServerState::default())),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Drive one inbound control connection until it closes.
    ///
    /// The first frame must be `Hello`; everything after is dispatched per
    /// message. Returns when the remote side disconnects or the server
    /// shuts down.
    pub async fn serve_connection(self: &Arc<Self>, conn: Connection) -> ConnectivityResult<()> {
        let conn = Arc::new(conn);
        let peer = match conn.recv_msg(self.limits.ack_timeout).await? {
            RelayMessage::Hello { peer } => peer,
            other => {
                return Err(ConnectivityError::Protocol(format!(
                    "expected Hello, got {:?}",
                    other
                )))
            }
        };
        trace!(peer = %peer, "relay control connection open");

        // Every exit path frees the peer's state, including mid-reply errors
        let result = self.drive_connection(peer, &conn).await;
        self.drop_peer(peer).await;
        trace!(peer = %peer, "relay control connection closed");
        result
    }

    async fn drive_connection(
        self: &Arc<Self>,
        peer: PeerId,
        conn: &Arc<Connection>,
    ) -> ConnectivityResult<()> {
        loop {
            let frame = tokio::select! {
                frame = conn.recv() => frame,
                _ = self.shutdown.notified() => None,
            };
            let Some(frame) = frame else { break };

            let msg: RelayMessage = match crate::protocol::decode(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(peer = %peer, "dropping malformed relay frame: {}", e);
                    continue;
                }
            };

            match msg {
                RelayMessage::Reserve | RelayMessage::Renew => {
                    let reply = self.handle_reservation_request(peer, conn).await;
                    conn.send_msg(&reply).await?;
                }
                RelayMessage::CircuitRequest { circuit, dst } => {
                    self.handle_circuit_request(circuit, peer, dst, conn).await?;
                }
                RelayMessage::CircuitAck { circuit, accept } => {
                    let mut state = self.state.write().await;
                    if let Some(tx) = state.pending_acks.remove(&circuit) {
                        let _ = tx.send(accept);
                    }
                }
                RelayMessage::Data { circuit, payload } => {
                    self.route_data(circuit, peer, payload).await;
                }
                RelayMessage::CircuitClose { circuit } => {
                    self.close_circuit(circuit, CircuitState::Closed).await;
                }
                other => {
                    trace!(peer = %peer, "ignoring unexpected relay message: {:?}", other);
                }
            }
        }

        Ok(())
    }

    /// Grant or deny a reservation (also answers renewals)
    async fn handle_reservation_request(
        &self,
        peer: PeerId,
        conn: &Arc<Connection>,
    ) -> RelayMessage {
        let mut state = self.state.write().await;
        let now = Instant::now();

        let window = self.limits.reservation_rate_window;
        let recent = state.recent_reserves.entry(peer).or_default();
        recent.retain(|t| now.duration_since(*t) < window);
        if recent.len() >= self.limits.reservation_rate_max {
            debug!(peer = %peer, "reservation rate limited");
            return RelayMessage::ReserveDenied {
                reason: DenyReason::RateLimited,
            };
        }
        recent.push(now);

        let renewal = state.reservations.contains_key(&peer);
        if !renewal && state.reservations.len() >= self.limits.max_reservations {
            debug!(peer = %peer, "reservation denied, at capacity");
            return RelayMessage::ReserveDenied {
                reason: DenyReason::ResourceLimit,
            };
        }

        let expires_at = now + self.limits.reservation_ttl;
        state.reservations.insert(
            peer,
            ServerReservation {
                conn: conn.clone(),
                expires_at,
            },
        );
        if renewal {
            trace!(peer = %peer, "reservation renewed");
        } else {
            info!(peer = %peer, ttl_secs = self.limits.reservation_ttl.as_secs(), "reservation granted");
        }

        RelayMessage::ReserveOk {
            ttl_secs: self.limits.reservation_ttl.as_secs(),
            proof: rand::random::<[u8; 16]>().to_vec(),
        }
    }

    /// Validate and broker a circuit from `src` to `dst`
    async fn handle_circuit_request(
        self: &Arc<Self>,
        circuit: CircuitId,
        src: PeerId,
        dst: PeerId,
        src_conn: &Arc<Connection>,
    ) -> ConnectivityResult<()> {
        let (ack_rx, dst_conn) = {
            let mut state = self.state.write().await;
            let now = Instant::now();

            let reason = if src == dst {
                Some(DenyReason::Policy)
            } else if !state
                .reservations
                .get(&dst)
                .map(|r| r.expires_at > now)
                .unwrap_or(false)
            {
                Some(DenyReason::NoReservation)
            } else if state.circuits.values().filter(|c| c.circuit.is_live()).count()
                >= self.limits.max_circuits
            {
                Some(DenyReason::ResourceLimit)
            } else if live_count(&state, src) >= self.limits.max_circuits_per_peer
                || live_count(&state, dst) >= self.limits.max_circuits_per_peer
            {
                Some(DenyReason::ResourceLimit)
            } else if state.circuits.contains_key(&circuit) {
                Some(DenyReason::Policy)
            } else {
                None
            };

            if let Some(reason) = reason {
                debug!(src = %src, dst = %dst, ?reason, "circuit denied");
                drop(state);
                return src_conn
                    .send_msg(&RelayMessage::CircuitDenied { circuit, reason })
                    .await;
            }

            // Reserve the slot while Pending so concurrent requests see it
            let (pump_tx, pump_rx) = mpsc::channel(CIRCUIT_QUEUE_DEPTH);
            state.circuits.insert(
                circuit,
                ServerCircuit {
                    circuit: Circuit::new(circuit, self.local_peer, src, dst),
                    pump_tx,
                    last_activity: Instant::now(),
                },
            );

            let (ack_tx, ack_rx) = oneshot::channel();
            state.pending_acks.insert(circuit, ack_tx);
            let dst_conn = state.reservations[&dst].conn.clone();

            self.spawn_pump(circuit, src, src_conn.clone(), dst, dst_conn.clone(), pump_rx);

            (ack_rx, dst_conn)
        };

        if dst_conn
            .send_msg(&RelayMessage::CircuitOpen { circuit, src })
            .await
            .is_err()
        {
            self.close_circuit(circuit, CircuitState::Failed).await;
            return src_conn
                .send_msg(&RelayMessage::CircuitDenied {
                    circuit,
                    reason: DenyReason::NoReservation,
                })
                .await;
        }

        let accepted = matches!(
            tokio::time::timeout(self.limits.ack_timeout, ack_rx).await,
            Ok(Ok(true))
        );

        if !accepted {
            self.close_circuit(circuit, CircuitState::Failed).await;
            self.state.write().await.pending_acks.remove(&circuit);
            return src_conn
                .send_msg(&RelayMessage::CircuitDenied {
                    circuit,
                    reason: DenyReason::Policy,
                })
                .await;
        }

        {
            let mut state = self.state.write().await;
            if let Some(entry) = state.circuits.get_mut(&circuit) {
                entry.circuit.state = CircuitState::Active;
            }
        }
        info!(src = %src, dst = %dst, circuit, "circuit active");
        src_conn
            .send_msg(&RelayMessage::CircuitGranted { circuit })
            .await
    }

    /// Each circuit forwards through its own task so one slow circuit never
    /// stalls its siblings.
    fn spawn_pump(
        self: &Arc<Self>,
        circuit: CircuitId,
        src: PeerId,
        src_conn: Arc<Connection>,
        dst: PeerId,
        dst_conn: Arc<Connection>,
        mut pump_rx: mpsc::Receiver<(PeerId, Vec<u8>)>,
    ) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((from, payload)) = pump_rx.recv().await {
                let out = if from == src { &dst_conn } else { &src_conn };
                let len = payload.len() as u64;
                let msg = RelayMessage::Data { circuit, payload };
                let frame = match encode(&msg) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => {
                        warn!(circuit, "failed to encode relayed frame: {}", e);
                        continue;
                    }
                };
                if out.send(frame).await.is_err() {
                    debug!(circuit, "circuit endpoint gone, tearing down");
                    server.close_circuit(circuit, CircuitState::Failed).await;
                    break;
                }
                server.state.write().await.bytes_relayed += len;
            }
            trace!(circuit, peer_a = %src, peer_b = %dst, "circuit pump stopped");
        });
    }

    async fn route_data(&self, circuit: CircuitId, from: PeerId, payload: Vec<u8>) {
        let mut state = self.state.write().await;
        let Some(entry) = state.circuits.get_mut(&circuit) else {
            trace!(circuit, "data for unknown circuit dropped");
            return;
        };
        if entry.circuit.state != CircuitState::Active || !entry.circuit.touches(from) {
            trace!(circuit, "data for non-active circuit dropped");
            return;
        }
        entry.last_activity = Instant::now();
        // Bounded per-circuit queue; a full queue sheds rather than blocks
        if entry.pump_tx.try_send((from, payload)).is_err() {
            trace!(circuit, "circuit queue full, frame dropped");
        }
    }

    /// Tear down a circuit and tell both live ends
    async fn close_circuit(&self, circuit: CircuitId, final_state: CircuitState) {
        let entry = {
            let mut state = self.state.write().await;
            state.pending_acks.remove(&circuit);
            state.circuits.remove(&circuit)
        };
        let Some(mut entry) = entry else { return };
        entry.circuit.state = final_state;
        debug!(circuit, ?final_state, "circuit removed");

        let close = RelayMessage::CircuitClose { circuit };
        let state = self.state.read().await;
        for peer in [entry.circuit.src, entry.circuit.dst] {
            if let Some(res) = state.reservations.get(&peer) {
                let _ = res.conn.send_msg(&close).await;
            }
        }
    }

    /// Free everything a disconnected peer held
    async fn drop_peer(&self, peer: PeerId) {
        let circuits: Vec<CircuitId> = {
            let mut state = self.state.write().await;
            state.reservations.remove(&peer);
            state
                .circuits
                .values()
                .filter(|c| c.circuit.touches(peer))
                .map(|c| c.circuit.id)
                .collect()
        };
        for id in circuits {
            self.close_circuit(id, CircuitState::Failed).await;
        }
    }

    /// Periodic sweep of expired reservations and idle circuits
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        server.sweep().await;
                    }
                    _ = server.shutdown.notified() => break,
                }
            }
        });
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let (expired, orphaned, idle) = {
            let mut state = self.state.write().await;
            let before = state.reservations.len();
            state.reservations.retain(|_, r| r.expires_at > now);
            let expired = before - state.reservations.len();

            let window = self.limits.reservation_rate_window;
            state.recent_reserves.retain(|_, attempts| {
                attempts.retain(|t| now.duration_since(*t) < window);
                !attempts.is_empty()
            });

            // A circuit only lives as long as its destination's reservation
            let orphaned: Vec<CircuitId> = state
                .circuits
                .values()
                .filter(|c| !state.reservations.contains_key(&c.circuit.dst))
                .map(|c| c.circuit.id)
                .collect();
            let idle: Vec<CircuitId> = state
                .circuits
                .values()
                .filter(|c| {
                    now.duration_since(c.last_activity) > self.limits.circuit_idle_timeout
                })
                .map(|c| c.circuit.id)
                .collect();
            (expired, orphaned, idle)
        };

        if expired > 0 {
            debug!(expired, "expired reservations removed");
        }
        for id in orphaned {
            debug!(circuit = id, "closing circuit, destination reservation expired");
            self.close_circuit(id, CircuitState::Closed).await;
        }
        for id in idle {
            debug!(circuit = id, "closing idle circuit");
            self.close_circuit(id, CircuitState::Closed).await;
        }
    }

    /// Stop serving; connections drain and circuits are freed
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let ids: Vec<CircuitId> = {
            let state = self.state.read().await;
            state.circuits.keys().copied().collect()
        };
        for id in ids {
            self.close_circuit(id, CircuitState::Closed).await;
        }
        self.state.write().await.reservations.clear();
        info!("relay server stopped");
    }

    pub async fn stats(&self) -> RelayServerStats {
        let state = self.state.read().await;
        RelayServerStats {
            active_reservations: state.reservations.len(),
            active_circuits: state
                .circuits
                .values()
                .filter(|c| c.circuit.state == CircuitState::Active)
                .count(),
            bytes_relayed: state.bytes_relayed,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }
}

fn live_count(state: &ServerState, peer: PeerId) -> usize {
    state
        .circuits
        .values()
        .filter(|c| c.circuit.is_live() && c.circuit.touches(peer))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionKind, FRAME_QUEUE_DEPTH};
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// Open a control connection to `server` as `peer`, Hello already sent.
    async fn control_conn(server: &Arc<RelayServer>, peer: PeerId) -> Arc<Connection> {
        let (client_side, server_side) = Connection::pair(
            peer,
            addr(1),
            server.local_peer(),
            addr(2),
            ConnectionKind::Direct,
        );
        let server = Arc::clone(server);
        tokio::spawn(async move {
            let _ = server.serve_connection(server_side).await;
        });
        client_side
            .send_msg(&RelayMessage::Hello { peer })
            .await
            .unwrap();
        Arc::new(client_side)
    }

    async fn reserve(conn: &Connection) -> RelayMessage {
        conn.send_msg(&RelayMessage::Reserve).await.unwrap();
        conn.recv_msg(Duration::from_secs(1)).await.unwrap()
    }

    #[tokio::test]
    async fn grants_and_limits_reservations() {
        let server = RelayServer::new(
            PeerId::random(),
            RelayLimits {
                max_reservations: 1,
                ..Default::default()
            },
        );

        let first = control_conn(&server, PeerId::random()).await;
        assert!(matches!(reserve(&first).await, RelayMessage::ReserveOk { .. }));

        let second = control_conn(&server, PeerId::random()).await;
        assert!(matches!(
            reserve(&second).await,
            RelayMessage::ReserveDenied {
                reason: DenyReason::ResourceLimit
            }
        ));
    }

    #[tokio::test]
    async fn rate_limits_reservation_floods() {
        let server = RelayServer::new(
            PeerId::random(),
            RelayLimits {
                reservation_rate_max: 2,
                reservation_rate_window: Duration::from_secs(60),
                ..Default::default()
            },
        );

        let conn = control_conn(&server, PeerId::random()).await;
        assert!(matches!(reserve(&conn).await, RelayMessage::ReserveOk { .. }));
        assert!(matches!(reserve(&conn).await, RelayMessage::ReserveOk { .. }));
        assert!(matches!(
            reserve(&conn).await,
            RelayMessage::ReserveDenied {
                reason: DenyReason::RateLimited
            }
        ));
    }

    #[tokio::test]
    async fn expired_reservation_takes_its_circuits_down() {
        let server = RelayServer::new(
            PeerId::random(),
            RelayLimits {
                reservation_ttl: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let dst_peer = PeerId::random();
        let dst = control_conn(&server, dst_peer).await;
        assert!(matches!(reserve(&dst).await, RelayMessage::ReserveOk { .. }));

        // Destination accepts whatever circuit comes in
        let dst_reader = Arc::clone(&dst);
        tokio::spawn(async move {
            while let Ok(msg) = dst_reader.recv_msg::<RelayMessage>(Duration::from_secs(1)).await {
                if let RelayMessage::CircuitOpen { circuit, .. } = msg {
                    let _ = dst_reader
                        .send_msg(&RelayMessage::CircuitAck {
                            circuit,
                            accept: true,
                        })
                        .await;
                }
            }
        });

        let src = control_conn(&server, PeerId::random()).await;
        src.send_msg(&RelayMessage::CircuitRequest {
            circuit: 9,
            dst: dst_peer,
        })
        .await
        .unwrap();
        assert!(matches!(
            src.recv_msg(Duration::from_secs(1)).await.unwrap(),
            RelayMessage::CircuitGranted { circuit: 9 }
        ));
        assert_eq!(server.stats().await.active_circuits, 1);

        // Reservation lapses without a renewal; the circuit goes with it
        tokio::time::sleep(Duration::from_millis(80)).await;
        server.sweep().await;

        let stats = server.stats().await;
        assert_eq!(stats.active_reservations, 0);
        assert_eq!(stats.active_circuits, 0);
    }

    #[tokio::test]
    async fn errored_connection_frees_peer_state() {
        let server = RelayServer::new(PeerId::random(), RelayLimits::default());
        let peer = PeerId::random();

        // Reply channel with no reader, so the reservation grant fails to send
        let (srv_tx, dead_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (cli_tx, srv_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        drop(dead_rx);
        let server_side =
            Connection::from_parts(peer, addr(1), ConnectionKind::Direct, srv_tx, srv_rx);

        let serve = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve_connection(server_side).await })
        };
        for msg in [RelayMessage::Hello { peer }, RelayMessage::Reserve] {
            cli_tx
                .send(Bytes::from(encode(&msg).unwrap()))
                .await
                .unwrap();
        }

        assert!(serve.await.unwrap().is_err());
        assert_eq!(server.stats().await.active_reservations, 0);
    }

    #[tokio::test]
    async fn sweep_forgets_stale_rate_tracking() {
        let server = RelayServer::new(
            PeerId::random(),
            RelayLimits {
                reservation_rate_window: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let conn = control_conn(&server, PeerId::random()).await;
        assert!(matches!(reserve(&conn).await, RelayMessage::ReserveOk { .. }));
        assert_eq!(server.state.read().await.recent_reserves.len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        server.sweep().await;
        assert!(server.state.read().await.recent_reserves.is_empty());
    }

    #[tokio::test]
    async fn circuit_requires_destination_reservation() {
        let server = RelayServer::new(PeerId::random(), RelayLimits::default());

        let src = control_conn(&server, PeerId::random()).await;
        src.send_msg(&RelayMessage::CircuitRequest {
            circuit: 7,
            dst: PeerId::random(),
        })
        .await
        .unwrap();

        assert!(matches!(
            src.recv_msg(Duration::from_secs(1)).await.unwrap(),
            RelayMessage::CircuitDenied {
                reason: DenyReason::NoReservation,
                ..
            }
        ));
    }
}
