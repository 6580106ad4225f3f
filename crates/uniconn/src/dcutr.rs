//! Direct connection upgrade through relay (hole punching)
//!
//! Given a relayed connection, the initiator exchanges candidate addresses
//! with the responder over the relay, measures the round trip, and both
//! sides dial each other half a round trip later so the simultaneous
//! attempts land inside the NAT's pinhole window. A successful direct
//! connection supersedes the relayed one; failure leaves the relayed link
//! in place and parks the pair behind a cooldown.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace};

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::metrics::Metrics;
use crate::protocol::{DcutrMessage, PeerId};
use crate::transport::{Connection, Host};

/// Unordered peer pair, normalized so both sides agree on the key
type PairKey = (PeerId, PeerId);

fn pair_key(a: PeerId, b: PeerId) -> PairKey {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Coordinates relay-to-direct upgrades
pub struct DcutrCoordinator {
    local_peer: PeerId,
    host: Arc<dyn Host>,
    metrics: Arc<Metrics>,
    /// Overall bound on one attempt (exchange + synchronized dial)
    attempt_timeout: Duration,
    /// A failed pair is not retried before this elapses
    cooldown: Duration,
    in_flight: Mutex<HashSet<PairKey>>,
    cooldowns: Mutex<HashMap<PairKey, Instant>>,
}

impl DcutrCoordinator {
    pub fn new(
        local_peer: PeerId,
        host: Arc<dyn Host>,
        metrics: Arc<Metrics>,
        attempt_timeout: Duration,
        cooldown: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_peer,
            host,
            metrics,
            attempt_timeout,
            cooldown,
            in_flight: Mutex::new(HashSet::new()),
            cooldowns: Mutex::new(HashMap::new()),
        })
    }

    /// Initiate an upgrade over `relayed`. On success the relayed
    /// connection is closed and the new direct connection returned.
    pub async fn initiate(&self, relayed: &Connection) -> ConnectivityResult<Connection> {
        let remote = relayed.peer();
        let pair = pair_key(self.local_peer, remote);

        self.admit(pair, true).await?;
        self.metrics.record_dcutr_attempt();

        let result = timeout(self.attempt_timeout, self.run_initiator(relayed)).await;
        self.in_flight.lock().await.remove(&pair);

        let result = match result {
            Ok(inner) => inner,
            Err(_) => Err(ConnectivityError::DcutrTimeout),
        };

        match result {
            Ok(direct) => {
                self.metrics.record_dcutr_success();
                self.cooldowns.lock().await.remove(&pair);
                relayed.close();
                info!(peer = %remote, "relayed connection upgraded to direct");
                Ok(direct)
            }
            Err(e) => {
                self.cooldowns
                    .lock()
                    .await
                    .insert(pair, Instant::now() + self.cooldown);
                debug!(peer = %remote, "DCUtR attempt failed: {}", e);
                Err(e)
            }
        }
    }

    /// Answer an upgrade started by the remote end of `relayed`.
    pub async fn respond(&self, relayed: &Connection) -> ConnectivityResult<Connection> {
        let remote = relayed.peer();
        let pair = pair_key(self.local_peer, remote);

        self.admit(pair, false).await?;
        let result = timeout(self.attempt_timeout, self.run_responder(relayed)).await;
        self.in_flight.lock().await.remove(&pair);

        match result {
            Ok(Ok(direct)) => {
                relayed.close();
                info!(peer = %remote, "accepted direct upgrade");
                Ok(direct)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectivityError::DcutrTimeout),
        }
    }

    /// One attempt per pair; initiators also honor the failure cooldown.
    async fn admit(&self, pair: PairKey, check_cooldown: bool) -> ConnectivityResult<()> {
        if check_cooldown {
            let cooldowns = self.cooldowns.lock().await;
            if let Some(until) = cooldowns.get(&pair) {
                if *until > Instant::now() {
                    trace!("pair cooling down, upgrade not admitted");
                    return Err(ConnectivityError::DcutrNotAdmitted);
                }
            }
        }
        if !self.in_flight.lock().await.insert(pair) {
            return Err(ConnectivityError::DcutrNotAdmitted);
        }
        Ok(())
    }

    async fn run_initiator(&self, relayed: &Connection) -> ConnectivityResult<Connection> {
        let sent_at = Instant::now();
        relayed
            .send_msg(&DcutrMessage::Connect {
                candidates: self.host.listen_addresses(),
                rtt_micros: 0,
            })
            .await?;

        let remote_candidates = match relayed.recv_msg(self.attempt_timeout).await? {
            DcutrMessage::Connect { candidates, .. } => candidates,
            other => {
                return Err(ConnectivityError::Protocol(format!(
                    "expected Connect, got {:?}",
                    other
                )))
            }
        };
        if remote_candidates.is_empty() {
            return Err(ConnectivityError::DcutrFailed(
                "remote offered no candidate addresses".into(),
            ));
        }

        // Midpoint scheme: the responder receives Sync roughly half a round
        // trip after we send it, so dialing after the same delay on both
        // sides lands the attempts together.
        let rtt = sent_at.elapsed();
        let dial_after = rtt / 2;
        relayed
            .send_msg(&DcutrMessage::Sync {
                dial_after_micros: dial_after.as_micros() as u64,
            })
            .await?;

        sleep(dial_after).await;
        self.punch(relayed.peer(), &remote_candidates).await
    }

    async fn run_responder(&self, relayed: &Connection) -> ConnectivityResult<Connection> {
        let remote_candidates = match relayed.recv_msg(self.attempt_timeout).await? {
            DcutrMessage::Connect { candidates, .. } => candidates,
            other => {
                return Err(ConnectivityError::Protocol(format!(
                    "expected Connect, got {:?}",
                    other
                )))
            }
        };

        relayed
            .send_msg(&DcutrMessage::Connect {
                candidates: self.host.listen_addresses(),
                rtt_micros: 0,
            })
            .await?;

        let dial_after = match relayed.recv_msg(self.attempt_timeout).await? {
            DcutrMessage::Sync { dial_after_micros } => Duration::from_micros(dial_after_micros),
            other => {
                return Err(ConnectivityError::Protocol(format!(
                    "expected Sync, got {:?}",
                    other
                )))
            }
        };
        if remote_candidates.is_empty() {
            return Err(ConnectivityError::DcutrFailed(
                "remote offered no candidate addresses".into(),
            ));
        }

        sleep(dial_after).await;
        self.punch(relayed.peer(), &remote_candidates).await
    }

    /// Dial every candidate in parallel; the first success wins.
    async fn punch(
        &self,
        remote: PeerId,
        candidates: &[SocketAddr],
    ) -> ConnectivityResult<Connection> {
        let (tx, mut rx) = mpsc::channel(candidates.len());
        for addr in candidates.iter().copied() {
            let host = self.host.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match host.dial(addr).await {
                    Ok(conn) => {
                        let _ = tx.send(conn).await;
                    }
                    Err(e) => trace!(%addr, "punch dial failed: {}", e),
                }
            });
        }
        drop(tx);

        match rx.recv().await {
            Some(conn) => {
                trace!(peer = %remote, addr = %conn.remote_addr(), "direct dial landed");
                Ok(conn)
            }
            None => Err(ConnectivityError::DcutrFailed(format!(
                "no direct path to {}",
                remote
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionKind;
    use async_trait::async_trait;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// Host whose dials either succeed with an in-memory pair or fail.
    struct PunchHost {
        local: PeerId,
        listen: Vec<SocketAddr>,
        dialable: bool,
        accepted: Mutex<Vec<Connection>>,
    }

    impl PunchHost {
        fn new(local: PeerId, listen: Vec<SocketAddr>, dialable: bool) -> Arc<Self> {
            Arc::new(Self {
                local,
                listen,
                dialable,
                accepted: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Host for PunchHost {
        async fn dial(&self, target: SocketAddr) -> ConnectivityResult<Connection> {
            if !self.dialable {
                return Err(ConnectivityError::DialFailed("unreachable".into()));
            }
            let (ours, theirs) = Connection::pair(
                self.local,
                self.listen.first().copied().unwrap_or_else(|| addr(0)),
                PeerId::random(),
                target,
                ConnectionKind::Direct,
            );
            self.accepted.lock().await.push(theirs);
            Ok(ours)
        }

        fn listen_addresses(&self) -> Vec<SocketAddr> {
            self.listen.clone()
        }
    }

    fn coordinator(
        peer: PeerId,
        host: Arc<PunchHost>,
        metrics: Arc<Metrics>,
    ) -> Arc<DcutrCoordinator> {
        DcutrCoordinator::new(
            peer,
            host,
            metrics,
            Duration::from_millis(500),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn successful_upgrade_counts_and_closes_relayed() {
        let a = PeerId::random();
        let b = PeerId::random();
        let relay = PeerId::random();
        let metrics_a = Arc::new(Metrics::default());
        let metrics_b = Arc::new(Metrics::default());

        let host_a = PunchHost::new(a, vec![addr(4001)], true);
        let host_b = PunchHost::new(b, vec![addr(4002)], true);
        let dcutr_a = coordinator(a, host_a, metrics_a.clone());
        let dcutr_b = coordinator(b, host_b, metrics_b);

        let (a_side, b_side) = Connection::pair(
            a,
            addr(4001),
            b,
            addr(4002),
            ConnectionKind::Relayed { relay },
        );

        let responder = tokio::spawn(async move { dcutr_b.respond(&b_side).await });

        let direct = dcutr_a.initiate(&a_side).await.unwrap();
        assert!(!direct.is_relayed());
        assert!(a_side.is_closed());
        assert!(responder.await.unwrap().is_ok());

        let snap = metrics_a.snapshot();
        assert_eq!(snap.dcutr_attempts, 1);
        assert_eq!(snap.dcutr_successes, 1);
    }

    #[tokio::test]
    async fn failed_punch_leaves_relayed_link_and_cools_down() {
        let a = PeerId::random();
        let b = PeerId::random();
        let metrics = Arc::new(Metrics::default());

        // Exchange works but no direct path exists
        let host_a = PunchHost::new(a, vec![addr(4003)], false);
        let host_b = PunchHost::new(b, vec![addr(4004)], false);
        let dcutr_a = coordinator(a, host_a, metrics.clone());
        let dcutr_b = coordinator(b, host_b, Arc::new(Metrics::default()));

        let (a_side, b_side) = Connection::pair(
            a,
            addr(4003),
            b,
            addr(4004),
            ConnectionKind::Relayed {
                relay: PeerId::random(),
            },
        );

        let responder = tokio::spawn(async move { dcutr_b.respond(&b_side).await });

        let err = dcutr_a.initiate(&a_side).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectivityError::DcutrFailed(_) | ConnectivityError::DcutrTimeout
        ));
        assert!(!a_side.is_closed());
        assert!(responder.await.unwrap().is_err());

        let snap = metrics.snapshot();
        assert_eq!(snap.dcutr_attempts, 1);
        assert_eq!(snap.dcutr_successes, 0);

        // Pair is cooling down, a fresh attempt is not admitted
        let err = dcutr_a.initiate(&a_side).await.unwrap_err();
        assert!(matches!(err, ConnectivityError::DcutrNotAdmitted));
        assert_eq!(metrics.snapshot().dcutr_attempts, 1);
    }
}
