//! Keyed timer service
//!
//! One task drives all per-key deadlines (reservation renewal, staleness
//! eviction) off a priority queue instead of one sleeping task per timer.
//! Re-scheduling a key supersedes its previous deadline; fired keys are
//! delivered on the receiver returned by [`TimerService::spawn`]. Dropping
//! the handle stops the task.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

struct Entry<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<K> Eq for Entry<K> {}

impl<K> Ord for Entry<K> {
    // Reversed so the BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

enum Command<K> {
    Schedule { key: K, at: Instant },
    Cancel { key: K },
}

/// Handle to the timer task
pub struct TimerService<K> {
    cmd_tx: mpsc::UnboundedSender<Command<K>>,
}

impl<K> TimerService<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Start the timer task; fired keys arrive on the returned receiver
    pub fn spawn() -> (Self, mpsc::Receiver<K>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = mpsc::channel(64);
        tokio::spawn(run(cmd_rx, fired_tx));
        (Self { cmd_tx }, fired_rx)
    }

    /// Register or reschedule `key` to fire at `at`
    pub fn schedule_at(&self, key: K, at: Instant) {
        let _ = self.cmd_tx.send(Command::Schedule { key, at });
    }

    /// Register or reschedule `key` to fire after `delay`
    pub fn schedule_after(&self, key: K, delay: Duration) {
        self.schedule_at(key, Instant::now() + delay);
    }

    /// Remove a pending deadline; a no-op if the key is not scheduled
    pub fn cancel(&self, key: K) {
        let _ = self.cmd_tx.send(Command::Cancel { key });
    }
}

async fn run<K>(mut cmd_rx: mpsc::UnboundedReceiver<Command<K>>, fired_tx: mpsc::Sender<K>)
where
    K: Eq + Hash + Clone + Send + 'static,
{
    let mut heap: BinaryHeap<Entry<K>> = BinaryHeap::new();
    // Current generation per key; stale heap entries are skipped on pop
    let mut live: HashMap<K, u64> = HashMap::new();
    let mut seq: u64 = 0;

    loop {
        let next_deadline = heap.peek().map(|e| e.at);
        let sleeper = async {
            match next_deadline {
                Some(at) => sleep_until(at).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Schedule { key, at }) => {
                        seq += 1;
                        live.insert(key.clone(), seq);
                        heap.push(Entry { at, seq, key });
                    }
                    Some(Command::Cancel { key }) => {
                        live.remove(&key);
                    }
                    None => break,
                }
            }
            _ = sleeper => {
                let now = Instant::now();
                while let Some(entry) = heap.peek() {
                    if entry.at > now {
                        break;
                    }
                    let entry = match heap.pop() {
                        Some(e) => e,
                        None => break,
                    };
                    if live.get(&entry.key) != Some(&entry.seq) {
                        continue; // superseded or cancelled
                    }
                    live.remove(&entry.key);
                    trace!("timer fired");
                    if fired_tx.send(entry.key).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
