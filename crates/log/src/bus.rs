//! Fan-out of provisioning step events and node output to subscribers.
//!
//! Producers never block on consumers: every subscriber reads through a
//! bounded broadcast queue and a subscriber that falls behind observes a
//! [`SubscriptionEvent::Lagged`] marker instead of slowing the producer.
//! Each channel keeps a bounded replay ring so late subscribers can request
//! a tail of history.

use std::collections::{HashMap, VecDeque};

use devnet_primitives::{LogLine, ProvisionLogEntry};
use parking_lot::Mutex;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;
const REPLAY_CAPACITY: usize = 512;

struct Channel<T> {
    tx: broadcast::Sender<T>,
    replay: VecDeque<T>,
}

impl<T: Clone> Channel<T> {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, replay: VecDeque::with_capacity(REPLAY_CAPACITY) }
    }

    fn publish(&mut self, item: T) {
        if self.replay.len() == REPLAY_CAPACITY {
            self.replay.pop_front();
        }
        self.replay.push_back(item.clone());
        // Send fails only when there is no subscriber, which is fine.
        let _ = self.tx.send(item);
    }

    fn subscribe(&self, tail: Option<usize>) -> Subscription<T> {
        let replay = match tail {
            Some(n) => self.replay.iter().rev().take(n).rev().cloned().collect(),
            None => self.replay.iter().cloned().collect(),
        };
        Subscription { replay, rx: self.tx.subscribe() }
    }
}

/// What a subscriber sees next on its queue.
#[derive(Debug)]
pub enum SubscriptionEvent<T> {
    Entry(T),
    /// The subscriber could not keep up and `missed` items were dropped from
    /// its queue. The stream continues with the most recent items.
    Lagged(u64),
    /// The producer side is gone.
    Closed,
}

/// A live view over one channel: buffered replay first, then the live feed.
pub struct Subscription<T> {
    replay: Vec<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Drains the replay tail captured at subscription time.
    pub fn take_replay(&mut self) -> Vec<T> {
        std::mem::take(&mut self.replay)
    }

    pub async fn recv(&mut self) -> SubscriptionEvent<T> {
        if !self.replay.is_empty() {
            return SubscriptionEvent::Entry(self.replay.remove(0));
        }
        match self.rx.recv().await {
            Ok(item) => SubscriptionEvent::Entry(item),
            Err(broadcast::error::RecvError::Lagged(missed)) => SubscriptionEvent::Lagged(missed),
            Err(broadcast::error::RecvError::Closed) => SubscriptionEvent::Closed,
        }
    }
}

/// Process-wide fan-out hub for provisioning and node log streams.
///
/// Channels are keyed by devnet (`<ns>/<name>`) for provisioning runs and by
/// node (`<ns>/<name>/<index>`) for node output.
#[derive(Default)]
pub struct LogBus {
    provision: Mutex<HashMap<String, Channel<ProvisionLogEntry>>>,
    nodes: Mutex<HashMap<String, Channel<LogLine>>>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devnet_key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    pub fn node_key(namespace: &str, name: &str, index: u32) -> String {
        format!("{namespace}/{name}/{index}")
    }

    pub fn publish_provision(&self, key: &str, entry: ProvisionLogEntry) {
        let mut channels = self.provision.lock();
        channels.entry(key.to_string()).or_insert_with(Channel::new).publish(entry);
    }

    pub fn subscribe_provision(&self, key: &str) -> Subscription<ProvisionLogEntry> {
        let mut channels = self.provision.lock();
        channels.entry(key.to_string()).or_insert_with(Channel::new).subscribe(None)
    }

    pub fn publish_node_line(&self, key: &str, line: LogLine) {
        let mut channels = self.nodes.lock();
        channels.entry(key.to_string()).or_insert_with(Channel::new).publish(line);
    }

    /// Subscribes to a node's output with at most `tail` lines of history.
    pub fn subscribe_node(&self, key: &str, tail: Option<usize>) -> Subscription<LogLine> {
        let mut channels = self.nodes.lock();
        channels.entry(key.to_string()).or_insert_with(Channel::new).subscribe(tail)
    }

    /// Drops the channels belonging to a deleted devnet.
    pub fn remove_devnet(&self, namespace: &str, name: &str) {
        let devnet_key = Self::devnet_key(namespace, name);
        self.provision.lock().remove(&devnet_key);
        let node_prefix = format!("{devnet_key}/");
        self.nodes.lock().retain(|key, _| !key.starts_with(&node_prefix));
    }
}
