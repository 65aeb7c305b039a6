//! The `persistence` module provides the retained-message store.
//!
//! When retention is enabled, the broker stores published messages here and
//! replays the backlog to newly registered subscribers, pruned by TTL and a
//! per-topic cap.
//!
//! It uses `sled` as an embedded key-value store, one tree per topic.

pub mod sled_store;

pub use sled_store::{Persistence, StoredMessage};
