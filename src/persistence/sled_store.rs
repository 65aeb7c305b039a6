use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::Db;
use tracing::debug;

/// A message as it sits in the retained store.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub sequence: u64,
    pub timestamp: i64,
}

/// Retained-message store, one sled tree per topic, keyed by sequence number
/// (big-endian, so iteration order is publish order).
#[derive(Clone)]
pub struct Persistence {
    db: Db,
    ttl_seconds: Option<i64>,
    max_messages_per_topic: Option<usize>,
}

impl Persistence {
    pub fn new(
        path: &str,
        ttl_seconds: Option<i64>,
        max_messages_per_topic: Option<usize>,
    ) -> sled::Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            ttl_seconds,
            max_messages_per_topic,
        })
    }

    /// Stores one message under its topic, evicting the oldest entries once
    /// the per-topic cap is exceeded.
    pub fn store_message(&self, topic: &str, payload: &[u8], sequence: u64) -> sled::Result<()> {
        let msg = StoredMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            sequence,
            timestamp: Utc::now().timestamp(),
        };

        let serialized = match serde_json::to_vec(&msg) {
            Ok(data) => data,
            Err(e) => {
                debug!("failed to serialize retained message: {e}");
                return Ok(());
            }
        };
        let topic_tree = self.db.open_tree(topic)?;
        topic_tree.insert(sequence.to_be_bytes(), serialized)?;

        if let Some(max) = self.max_messages_per_topic {
            while topic_tree.len() > max {
                match topic_tree.pop_min()? {
                    Some(_) => {}
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Returns the retained backlog for a topic in publish order, after
    /// pruning expired entries.
    pub fn load_messages(&self, topic: &str) -> Vec<StoredMessage> {
        self.cleanup_old_messages(topic);
        let Ok(topic_tree) = self.db.open_tree(topic) else {
            return Vec::new();
        };
        topic_tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(_, val)| serde_json::from_slice(&val).ok())
            .collect()
    }

    fn cleanup_old_messages(&self, topic: &str) {
        if let Some(ttl) = self.ttl_seconds {
            let expiry_time = Utc::now().timestamp() - ttl;

            let Ok(topic_tree) = self.db.open_tree(topic) else {
                return;
            };
            let old_keys: Vec<_> = topic_tree
                .iter()
                .filter_map(|res| res.ok())
                .filter_map(|(key, val)| {
                    let stored: StoredMessage = serde_json::from_slice(&val).ok()?;
                    if stored.timestamp < expiry_time {
                        Some(key)
                    } else {
                        None
                    }
                })
                .collect();

            for key in old_keys {
                let _ = topic_tree.remove(key);
            }
        }
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_messages_per_topic", &self.max_messages_per_topic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(ttl: Option<i64>, max: Option<usize>) -> (Persistence, tempfile::TempDir) {
        let dir = tempdir().expect("create tempdir");
        let store = Persistence::new(dir.path().to_str().unwrap(), ttl, max).expect("open sled");
        (store, dir)
    }

    #[test]
    fn store_and_load_in_publish_order() {
        let (store, _dir) = open(None, None);
        store.store_message("news", b"first", 1).unwrap();
        store.store_message("news", b"second", 2).unwrap();

        let messages = store.load_messages("news");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, b"first");
        assert_eq!(messages[0].sequence, 1);
        assert_eq!(messages[1].payload, b"second");
    }

    #[test]
    fn topics_are_isolated() {
        let (store, _dir) = open(None, None);
        store.store_message("a", b"x", 1).unwrap();
        store.store_message("b", b"y", 1).unwrap();

        assert_eq!(store.load_messages("a").len(), 1);
        assert_eq!(store.load_messages("b").len(), 1);
        assert!(store.load_messages("c").is_empty());
    }

    #[test]
    fn per_topic_cap_evicts_oldest() {
        let (store, _dir) = open(None, Some(2));
        store.store_message("news", b"one", 1).unwrap();
        store.store_message("news", b"two", 2).unwrap();
        store.store_message("news", b"three", 3).unwrap();

        let messages = store.load_messages("news");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, b"two");
        assert_eq!(messages[1].payload, b"three");
    }

    #[test]
    fn expired_messages_are_pruned() {
        // A negative ttl puts the expiry cutoff in the future, so even an
        // entry stored this instant is already stale
        let (store, _dir) = open(Some(-1), None);
        store.store_message("news", b"stale", 1).unwrap();
        assert!(store.load_messages("news").is_empty());
    }
}
