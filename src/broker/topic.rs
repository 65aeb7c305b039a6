use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use crate::transport::frame::Frame;

pub type ClientId = String;

/// Represents a topic in the broker.
///
/// A topic tracks the connections registered as publishers, the connections
/// registered as subscribers together with their outbound frame senders, and
/// the next sequence number to assign. The entry is created on first
/// registration and discarded once the last registration is removed.
#[derive(Debug)]
pub struct Topic {
    pub name: String,
    pub publishers: HashSet<ClientId>,
    pub subscribers: HashMap<ClientId, mpsc::Sender<Frame>>,
    next_seq: u64,
}

impl Topic {
    /// Creates a new topic entry with no registrations.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            publishers: HashSet::new(),
            subscribers: HashMap::new(),
            next_seq: 1,
        }
    }

    pub fn add_publisher(&mut self, id: ClientId) {
        self.publishers.insert(id);
    }

    pub fn remove_publisher(&mut self, id: &ClientId) {
        self.publishers.remove(id);
    }

    pub fn add_subscriber(&mut self, id: ClientId, sender: mpsc::Sender<Frame>) {
        self.subscribers.insert(id, sender);
    }

    pub fn remove_subscriber(&mut self, id: &ClientId) {
        self.subscribers.remove(id);
    }

    /// True once every publisher and subscriber registration is gone; the
    /// broker then drops the entry.
    pub fn is_unused(&self) -> bool {
        self.publishers.is_empty() && self.subscribers.is_empty()
    }

    /// Assigns the next per-topic sequence number.
    pub fn assign_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Snapshot of the current subscriber set, taken at fan-out time. A
    /// message in flight is delivered to exactly this set.
    pub fn snapshot_subscribers(&self) -> Vec<(ClientId, mpsc::Sender<Frame>)> {
        self.subscribers
            .iter()
            .map(|(id, sender)| (id.clone(), sender.clone()))
            .collect()
    }
}
