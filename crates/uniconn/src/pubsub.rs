//! Pubsub-based peer discovery
//!
//! Publishes a self-announcement on the configured topics at a fixed
//! cadence and folds announcements from other peers into the discovery
//! channel. The bus itself is an external collaborator; this module only
//! shapes announcements and filters what comes back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;
use tracing::{debug, trace, warn};

use crate::error::ConnectivityResult;
use crate::peer_store::PeerRecord;
use crate::protocol::{self, Announcement, DiscoverySource, PeerId};
use crate::transport::{Host, PubsubBus};

pub struct PubsubDiscovery {
    local_peer: PeerId,
    host: Arc<dyn Host>,
    bus: Arc<dyn PubsubBus>,
    topics: Vec<String>,
    announce_interval: Duration,
    dedup_window: Duration,
    listen_only: bool,
    relay_capable: bool,
    events: mpsc::Sender<PeerRecord>,
    shutdown: Arc<Notify>,
}

impl PubsubDiscovery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        host: Arc<dyn Host>,
        bus: Arc<dyn PubsubBus>,
        topics: Vec<String>,
        announce_interval: Duration,
        dedup_window: Duration,
        listen_only: bool,
        relay_capable: bool,
        events: mpsc::Sender<PeerRecord>,
    ) -> Self {
        Self {
            local_peer,
            host,
            bus,
            topics,
            announce_interval,
            dedup_window,
            listen_only,
            relay_capable,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Subscribe every topic and start the announce loop.
    pub async fn start(self: &Arc<Self>) -> ConnectivityResult<()> {
        for topic in &self.topics {
            let rx = self.bus.subscribe(topic).await?;
            let this = self.clone();
            let topic = topic.clone();
            tokio::spawn(async move { this.consume(topic, rx).await });
        }

        if !self.listen_only {
            let this = self.clone();
            tokio::spawn(async move { this.announce_loop().await });
        }
        debug!(topics = self.topics.len(), "pubsub discovery started");
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    async fn announce_loop(&self) {
        let mut timer = interval(self.announce_interval);
        loop {
            tokio::select! {
                _ = timer.tick() => self.announce_once().await,
                _ = self.shutdown.notified() => return,
            }
        }
    }

    async fn announce_once(&self) {
        let announcement = Announcement {
            peer: self.local_peer,
            addresses: self.host.listen_addresses(),
            relay_capable: self.relay_capable,
        };
        if announcement.addresses.is_empty() {
            trace!("skipping pubsub announce, no listen addresses yet");
            return;
        }
        let bytes = match protocol::encode(&announcement) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                warn!("announcement encode failed: {}", e);
                return;
            }
        };
        for topic in &self.topics {
            if let Err(e) = self.bus.publish(topic, bytes.clone()).await {
                debug!(%topic, "pubsub publish failed: {}", e);
            }
        }
    }

    async fn consume(&self, topic: String, mut rx: mpsc::Receiver<Bytes>) {
        // Identical announcements from one peer are collapsed within the
        // dedup window so a chatty bus does not hammer the store.
        let mut recent: HashMap<PeerId, (Announcement, Instant)> = HashMap::new();

        loop {
            let data = tokio::select! {
                data = rx.recv() => match data {
                    Some(data) => data,
                    None => {
                        debug!(%topic, "pubsub subscription ended");
                        return;
                    }
                },
                _ = self.shutdown.notified() => return,
            };

            let announcement: Announcement = match protocol::decode(&data) {
                Ok(a) => a,
                Err(_) => {
                    trace!(%topic, "dropping malformed announcement");
                    continue;
                }
            };
            if announcement.peer == self.local_peer {
                continue;
            }

            let now = Instant::now();
            if let Some((previous, at)) = recent.get(&announcement.peer) {
                if *previous == announcement && now.duration_since(*at) < self.dedup_window {
                    continue;
                }
            }
            recent.insert(announcement.peer, (announcement.clone(), now));

            let record = PeerRecord::new(
                announcement.peer,
                announcement.addresses,
                DiscoverySource::Pubsub,
            )
            .with_relay_capable(announcement.relay_capable);
            debug!(peer = %record.peer_id, %topic, "peer found via pubsub");
            if self.events.send(record).await.is_err() {
                return;
            }
        }
    }
}
