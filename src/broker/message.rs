use bytes::Bytes;
use chrono::Utc;

/// Delivery guarantee selected per publish call.
///
/// Every place that decides delivery policy matches on this exhaustively, so
/// adding a level is a compile-time-checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Hand the message to each subscriber queue once; full queues drop it.
    BestEffort,
    /// Track per-subscriber acknowledgments and retry outstanding ones.
    Reliable,
}

/// Represents a published message in the pub/sub system.
///
/// A message consists of the topic it was published on, the payload bytes,
/// the reliability level requested by the publisher, the per-topic sequence
/// number assigned by the delivery engine, and a millisecond timestamp taken
/// where this copy of the message was constructed.
///
/// Messages are immutable once constructed.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub sequence: u64,
    pub reliability: Reliability,
    pub timestamp: i64,
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(topic: String, payload: Bytes, sequence: u64, reliability: Reliability) -> Self {
        Self {
            topic,
            payload,
            sequence,
            reliability,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}
