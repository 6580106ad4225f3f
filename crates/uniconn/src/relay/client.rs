//! Circuit relay client
//!
//! Holds reservations on remote relays so this node stays reachable, renews
//! them ahead of expiry, and dials targets through a relay when direct
//! dialing fails. A relay that keeps failing is parked behind exponential
//! backoff before it is tried again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tracing::{debug, info, trace, warn};

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::protocol::{decode, CircuitId, PeerId, RelayMessage};
use crate::timers::TimerService;
use crate::transport::{Connection, ConnectionKind, Host, FRAME_QUEUE_DEPTH};

/// Renewal retry delay after a single (first) failure
const RENEW_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Base/backoff cap for relays marked unusable
const BACKOFF_BASE: Duration = Duration::from_secs(30);
const BACKOFF_CAP: Duration = Duration::from_secs(600);

/// A lease on a relay
#[derive(Debug, Clone)]
pub struct Reservation {
    pub relay: PeerId,
    pub expiry: Instant,
    pub renew_at: Instant,
    pub proof: Vec<u8>,
}

/// A circuit someone opened to us through a relay we are reserved on
pub struct InboundRelayed {
    pub src: PeerId,
    pub relay: PeerId,
    pub conn: Connection,
}

struct HeldReservation {
    reservation: Reservation,
    conn: Arc<Connection>,
    failed_renewals: u32,
    /// Demux of incoming circuit data frames on the reservation connection
    circuits: HashMap<CircuitId, mpsc::Sender<Bytes>>,
    pending_renewal: Option<oneshot::Sender<RelayMessage>>,
}

struct Backoff {
    until: Instant,
    failures: u32,
}

#[derive(Default)]
struct ClientState {
    held: HashMap<PeerId, HeldReservation>,
    backoff: HashMap<PeerId, Backoff>,
    rr_cursor: usize,
}

/// Relay client: reservation upkeep plus relayed dialing
pub struct RelayClient {
    local_peer: PeerId,
    host: Arc<dyn Host>,
    max_reservations: usize,
    renew_margin: Duration,
    request_timeout: Duration,
    state: Arc<RwLock<ClientState>>,
    renew_timers: TimerService<PeerId>,
    inbound_tx: mpsc::Sender<InboundRelayed>,
    shutdown: Arc<Notify>,
}

impl RelayClient {
    /// Create the client and its renewal driver. Inbound relayed circuits
    /// are surfaced on the returned receiver.
    pub fn new(
        local_peer: PeerId,
        host: Arc<dyn Host>,
        max_reservations: usize,
        renew_margin: Duration,
        request_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<InboundRelayed>) {
        let (renew_timers, renew_fired) = TimerService::spawn();
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let client = Arc::new(Self {
            local_peer,
            host,
            max_reservations,
            renew_margin,
            request_timeout,
            state: Arc::new(RwLock::new(ClientState::default())),
            renew_timers,
            inbound_tx,
            shutdown: Arc::new(Notify::new()),
        });
        client.spawn_renewal_driver(renew_fired);
        (client, inbound_rx)
    }

    /// Number of reservations currently held
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.held.len()
    }

    pub async fn reservation(&self, relay: PeerId) -> Option<Reservation> {
        self.state
            .read()
            .await
            .held
            .get(&relay)
            .map(|h| h.reservation.clone())
    }

    /// Whether this relay is currently parked behind backoff
    pub async fn is_backed_off(&self, relay: PeerId) -> bool {
        self.state
            .read()
            .await
            .backoff
            .get(&relay)
            .map(|b| b.until > Instant::now())
            .unwrap_or(false)
    }

    /// Top up reservations round-robin across `candidates` until
    /// `max_reservations` are held. Unusable relays are skipped.
    pub async fn ensure_reservations(self: &Arc<Self>, candidates: &[(PeerId, SocketAddr)]) {
        if candidates.is_empty() {
            return;
        }
        let start = {
            let mut state = self.state.write().await;
            state.rr_cursor = state.rr_cursor.wrapping_add(1);
            state.rr_cursor
        };

        for i in 0..candidates.len() {
            let (relay, addr) = candidates[(start + i) % candidates.len()];
            if self.reservation_count().await >= self.max_reservations {
                break;
            }
            if relay == self.local_peer
                || self.reservation(relay).await.is_some()
                || self.is_backed_off(relay).await
            {
                continue;
            }
            if let Err(e) = self.reserve(relay, addr).await {
                debug!(relay = %relay, "reservation attempt failed: {}", e);
            }
        }
    }

    /// Reserve a slot on `relay`. Denials come back typed so the caller can
    /// move on to a different relay.
    pub async fn reserve(
        self: &Arc<Self>,
        relay: PeerId,
        addr: SocketAddr,
    ) -> ConnectivityResult<Reservation> {
        if self.is_backed_off(relay).await {
            return Err(ConnectivityError::RelayUnreachable(relay));
        }

        let conn = self.host.dial(addr).await?;
        conn.send_msg(&RelayMessage::Hello {
            peer: self.local_peer,
        })
        .await?;
        conn.send_msg(&RelayMessage::Reserve).await?;

        match conn.recv_msg(self.request_timeout).await? {
            RelayMessage::ReserveOk { ttl_secs, proof } => {
                let reservation = self.build_reservation(relay, ttl_secs, proof);
                let conn = Arc::new(conn);
                {
                    let mut state = self.state.write().await;
                    state.backoff.remove(&relay);
                    state.held.insert(
                        relay,
                        HeldReservation {
                            reservation: reservation.clone(),
                            conn: conn.clone(),
                            failed_renewals: 0,
                            circuits: HashMap::new(),
                            pending_renewal: None,
                        },
                    );
                }
                self.renew_timers.schedule_after(
                    relay,
                    reservation.renew_at.saturating_duration_since(Instant::now()),
                );
                self.spawn_reservation_reader(relay, conn);
                info!(relay = %relay, "reservation held");
                Ok(reservation)
            }
            RelayMessage::ReserveDenied { reason } => {
                debug!(relay = %relay, %reason, "reservation denied");
                Err(ConnectivityError::ReservationDenied(reason))
            }
            other => Err(ConnectivityError::Protocol(format!(
                "unexpected reservation response: {:?}",
                other
            ))),
        }
    }

    fn build_reservation(&self, relay: PeerId, ttl_secs: u64, proof: Vec<u8>) -> Reservation {
        let ttl = Duration::from_secs(ttl_secs);
        let expiry = Instant::now() + ttl;
        // Renew strictly before expiry even when the granted TTL is short
        let margin = self.renew_margin.min(ttl / 2);
        Reservation {
            relay,
            expiry,
            renew_at: expiry - margin,
            proof,
        }
    }

    /// Ask `relay` for a circuit to `target`; returns a relayed connection
    /// once the circuit is Active.
    pub async fn dial_via_relay(
        &self,
        relay: PeerId,
        relay_addr: SocketAddr,
        target: PeerId,
    ) -> ConnectivityResult<Connection> {
        if self.is_backed_off(relay).await {
            return Err(ConnectivityError::RelayUnreachable(relay));
        }

        // Dedicated control connection per outbound circuit; the
        // reservation connection stays free for inbound traffic.
        let control = Arc::new(self.host.dial(relay_addr).await?);
        control
            .send_msg(&RelayMessage::Hello {
                peer: self.local_peer,
            })
            .await?;

        let circuit: CircuitId = rand::random();
        control
            .send_msg(&RelayMessage::CircuitRequest {
                circuit,
                dst: target,
            })
            .await?;

        let deadline = Instant::now() + self.request_timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(ConnectivityError::Timeout);
            }
            match control.recv_msg(left).await? {
                RelayMessage::CircuitGranted { circuit: id } if id == circuit => {
                    trace!(relay = %relay, target = %target, circuit, "relayed circuit active");
                    return Ok(wrap_dialed_circuit(control, circuit, target, relay));
                }
                RelayMessage::CircuitDenied { circuit: id, reason } if id == circuit => {
                    return Err(ConnectivityError::CircuitDenied(reason));
                }
                other => {
                    trace!("ignoring frame while waiting for circuit: {:?}", other);
                }
            }
        }
    }

    /// Reads the reservation connection: renewal answers, incoming circuits
    /// and relayed data frames.
    fn spawn_reservation_reader(self: &Arc<Self>, relay: PeerId, conn: Arc<Connection>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = conn.recv() => frame,
                    _ = client.shutdown.notified() => None,
                };
                let Some(frame) = frame else { break };
                let msg: RelayMessage = match decode(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(relay = %relay, "malformed frame from relay: {}", e);
                        continue;
                    }
                };
                client.handle_reservation_frame(relay, &conn, msg).await;
            }

            // Relay disconnect destroys the reservation
            if client.state.write().await.held.remove(&relay).is_some() {
                warn!(relay = %relay, "reservation connection lost");
                client.renew_timers.cancel(relay);
            }
        });
    }

    async fn handle_reservation_frame(
        self: &Arc<Self>,
        relay: PeerId,
        conn: &Arc<Connection>,
        msg: RelayMessage,
    ) {
        match msg {
            answer @ (RelayMessage::ReserveOk { .. } | RelayMessage::ReserveDenied { .. }) => {
                let mut state = self.state.write().await;
                if let Some(held) = state.held.get_mut(&relay) {
                    if let Some(tx) = held.pending_renewal.take() {
                        let _ = tx.send(answer);
                    }
                }
            }
            RelayMessage::CircuitOpen { circuit, src } => {
                let _ = conn
                    .send_msg(&RelayMessage::CircuitAck {
                        circuit,
                        accept: true,
                    })
                    .await;

                let (in_tx, in_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
                let (out_tx, out_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
                let relayed = Connection::from_parts(
                    src,
                    conn.remote_addr(),
                    ConnectionKind::Relayed { relay },
                    out_tx,
                    in_rx,
                );
                spawn_outbound_pump(conn.clone(), circuit, out_rx);
                if let Some(held) = self.state.write().await.held.get_mut(&relay) {
                    held.circuits.insert(circuit, in_tx);
                }

                debug!(src = %src, relay = %relay, circuit, "inbound relayed circuit");
                if self
                    .inbound_tx
                    .send(InboundRelayed {
                        src,
                        relay,
                        conn: relayed,
                    })
                    .await
                    .is_err()
                {
                    let _ = conn.send_msg(&RelayMessage::CircuitClose { circuit }).await;
                }
            }
            RelayMessage::Data { circuit, payload } => {
                let state = self.state.read().await;
                if let Some(held) = state.held.get(&relay) {
                    if let Some(tx) = held.circuits.get(&circuit) {
                        if tx.try_send(Bytes::from(payload)).is_err() {
                            trace!(circuit, "inbound circuit queue full, frame dropped");
                        }
                    }
                }
            }
            RelayMessage::CircuitClose { circuit } => {
                let mut state = self.state.write().await;
                if let Some(held) = state.held.get_mut(&relay) {
                    held.circuits.remove(&circuit);
                }
            }
            other => {
                trace!(relay = %relay, "ignoring relay frame: {:?}", other);
            }
        }
    }

    fn spawn_renewal_driver(self: &Arc<Self>, mut fired: mpsc::Receiver<PeerId>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let relay = tokio::select! {
                    relay = fired.recv() => match relay {
                        Some(relay) => relay,
                        None => break,
                    },
                    _ = client.shutdown.notified() => break,
                };
                client.renew(relay).await;
            }
        });
    }

    /// One renewal exchange. Two consecutive failures drop the reservation
    /// and park the relay behind exponential backoff.
    async fn renew(self: &Arc<Self>, relay: PeerId) {
        let (conn, rx) = {
            let mut state = self.state.write().await;
            let Some(held) = state.held.get_mut(&relay) else {
                return;
            };
            let (tx, rx) = oneshot::channel();
            held.pending_renewal = Some(tx);
            (held.conn.clone(), rx)
        };

        let answer = if conn.send_msg(&RelayMessage::Renew).await.is_err() {
            None
        } else {
            (tokio::time::timeout(self.request_timeout, rx).await)
                .ok()
                .and_then(|r| r.ok())
        };

        match answer {
            Some(RelayMessage::ReserveOk { ttl_secs, proof }) => {
                let reservation = self.build_reservation(relay, ttl_secs, proof);
                let mut state = self.state.write().await;
                if let Some(held) = state.held.get_mut(&relay) {
                    trace!(relay = %relay, "reservation renewed");
                    held.failed_renewals = 0;
                    held.reservation = reservation.clone();
                    self.renew_timers.schedule_after(
                        relay,
                        reservation.renew_at.saturating_duration_since(Instant::now()),
                    );
                }
            }
            _ => self.renewal_failed(relay).await,
        }
    }

    async fn renewal_failed(&self, relay: PeerId) {
        let mut state = self.state.write().await;
        let Some(held) = state.held.get_mut(&relay) else {
            return;
        };
        held.failed_renewals += 1;
        held.pending_renewal = None;

        if held.failed_renewals < 2 {
            warn!(relay = %relay, "reservation renewal failed, retrying");
            self.renew_timers.schedule_after(relay, RENEW_RETRY_DELAY);
            return;
        }

        // Second consecutive failure: give up on this relay for a while
        if let Some(held) = state.held.remove(&relay) {
            held.conn.close();
        }
        let failures = state
            .backoff
            .get(&relay)
            .map(|b| b.failures + 1)
            .unwrap_or(1);
        let delay = BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(failures - 1));
        state.backoff.insert(
            relay,
            Backoff {
                until: Instant::now() + delay,
                failures,
            },
        );
        self.renew_timers.cancel(relay);
        warn!(relay = %relay, backoff_secs = delay.as_secs(), "reservation dropped, relay backed off");
    }

    /// Drop all reservations and stop background work
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let mut state = self.state.write().await;
        for (relay, held) in state.held.drain() {
            self.renew_timers.cancel(relay);
            held.conn.close();
        }
        info!("relay client stopped");
    }
}

/// Wrap a dedicated outbound-circuit control connection into a relayed
/// [`Connection`]: frames out become `Data`, `Data` frames in surface as
/// received frames, and dropping the handle sends `CircuitClose`.
fn wrap_dialed_circuit(
    control: Arc<Connection>,
    circuit: CircuitId,
    target: PeerId,
    relay: PeerId,
) -> Connection {
    let (in_tx, in_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let (out_tx, out_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let relayed = Connection::from_parts(
        target,
        control.remote_addr(),
        ConnectionKind::Relayed { relay },
        out_tx,
        in_rx,
    );

    spawn_outbound_pump(control.clone(), circuit, out_rx);

    tokio::spawn(async move {
        while let Some(frame) = control.recv().await {
            match decode::<RelayMessage>(&frame) {
                Ok(RelayMessage::Data {
                    circuit: id,
                    payload,
                }) if id == circuit => {
                    if in_tx.send(Bytes::from(payload)).await.is_err() {
                        break;
                    }
                }
                Ok(RelayMessage::CircuitClose { circuit: id }) if id == circuit => break,
                Ok(other) => trace!("ignoring frame on circuit connection: {:?}", other),
                Err(e) => debug!("malformed frame on circuit connection: {}", e),
            }
        }
    });

    relayed
}

/// Drains a relayed connection's outbound frames into `Data` messages on
/// the relay control connection; closes the circuit when the handle drops.
fn spawn_outbound_pump(
    control: Arc<Connection>,
    circuit: CircuitId,
    mut out_rx: mpsc::Receiver<Bytes>,
) {
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let msg = RelayMessage::Data {
                circuit,
                payload: frame.to_vec(),
            };
            if control.send_msg(&msg).await.is_err() {
                return;
            }
        }
        let _ = control
            .send_msg(&RelayMessage::CircuitClose { circuit })
            .await;
    });
}
