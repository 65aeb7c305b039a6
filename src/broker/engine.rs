//! Broker delivery engine.
//!
//! This module contains the in-memory broker core responsible for:
//! - managing topics and their publisher/subscriber registrations
//! - fanning published messages out to the subscriber snapshot
//! - tracking reliable messages and retrying until acknowledged
//! - replaying retained messages to new subscribers via `Persistence`
//!
//! Topics, clients and the pending-ack table live in sharded concurrent maps
//! so operations on unrelated topics never serialize against each other; a
//! lock is only ever scoped to a single topic entry or pending message. The
//! retry sweep runs as a background task and re-sends un-acked reliable
//! messages to the outstanding subscribers when the ack timeout elapses,
//! capped by the retry budget.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::broker::delivery::PendingMessage;
use crate::broker::message::Reliability;
use crate::broker::topic::{ClientId, Topic};
use crate::config::BrokerSettings;
use crate::persistence::Persistence;
use crate::transport::frame::{Frame, ReportBody, ReportStatus};

/// How often the retry sweep wakes up to look at the pending-ack table.
const SWEEP_INTERVAL_MS: u64 = 250;

/// A connected client as seen by the broker: its id and the sender feeding
/// the connection's outbound frame queue.
#[derive(Debug, Clone)]
pub struct ClientConn {
    pub id: ClientId,
    pub sender: mpsc::Sender<Frame>,
}

/// The broker core managing topics, clients and in-flight reliable messages.
///
/// Fan-out uses snapshot semantics: a published message goes to exactly the
/// subscribers registered at the instant its sequence number is assigned.
#[derive(Debug)]
pub struct Broker {
    pub(crate) topics: DashMap<String, Topic>,
    pub(crate) clients: DashMap<ClientId, ClientConn>,
    pending_acks: DashMap<(String, u64), PendingMessage>,
    persistence: Option<Persistence>,
    settings: BrokerSettings,
    /// Total `publish` calls accepted.
    pub publish_count: AtomicUsize,
    /// Deliveries dropped because a subscriber queue was full.
    pub dropped_count: AtomicUsize,
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            topics: DashMap::new(),
            clients: DashMap::new(),
            pending_acks: DashMap::new(),
            persistence: None,
            settings,
            publish_count: AtomicUsize::new(0),
            dropped_count: AtomicUsize::new(0),
        }
    }

    /// A broker that retains published messages and replays them to new
    /// subscribers.
    pub fn new_with_persistence(settings: BrokerSettings, persistence: Persistence) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::new(settings)
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Registers a newly connected client so frames can be routed to it.
    pub fn register_client(&self, client: ClientConn) {
        debug!("client {} connected", client.id);
        self.clients.insert(client.id.clone(), client);
    }

    /// Registers `client` as a publisher on `topic`, creating the topic on
    /// first registration.
    pub fn register_publisher(&self, topic: &str, client: &ClientId) {
        let mut entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic));
        entry.add_publisher(client.clone());
        info!("{client} registered as publisher on '{topic}'");
    }

    /// Registers `client` as a subscriber on `topic`, creating the topic on
    /// first registration and replaying any retained backlog.
    pub fn register_subscriber(&self, topic: &str, client: &ClientId) {
        let Some(sender) = self.clients.get(client).map(|c| c.sender.clone()) else {
            warn!("subscribe from unknown client {client}");
            return;
        };

        let mut entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic));
        entry.add_subscriber(client.clone(), sender.clone());

        // Replay while holding the topic entry, so retained messages are
        // ordered ahead of any concurrent live publish.
        if let Some(persistence) = &self.persistence {
            for stored in persistence.load_messages(topic) {
                let frame = Frame::data(
                    topic,
                    Reliability::BestEffort,
                    stored.sequence,
                    Bytes::from(stored.payload),
                );
                if sender.try_send(frame).is_err() {
                    self.dropped_count.fetch_add(1, Ordering::Relaxed);
                    warn!("replay to {client} on '{topic}' dropped, queue full");
                }
            }
        }
        info!("{client} subscribed to '{topic}'");
    }

    /// Removes one registration of `client` on `topic`; the topic entry is
    /// discarded once its last registration is gone.
    pub fn unregister(&self, topic: &str, client: &ClientId, subscriber_role: bool) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            if subscriber_role {
                entry.remove_subscriber(client);
            } else {
                entry.remove_publisher(client);
            }
            let unused = entry.is_unused();
            drop(entry);
            if unused && self.topics.remove_if(topic, |_, t| t.is_unused()).is_some() {
                info!("topic '{topic}' removed");
            }
        }
        if subscriber_role {
            self.prune_outstanding(client, Some(topic));
        }
    }

    /// Publishes a message on behalf of `publisher`.
    ///
    /// Returns a report to send back immediately: rejections for both
    /// reliability levels, and the instant success report for a reliable
    /// publish that found no subscribers. Returns `None` when the message was
    /// handed off (best-effort) or is pending acknowledgments (reliable).
    pub fn publish(
        &self,
        publisher: &ClientId,
        corr: u64,
        topic: &str,
        reliability: Reliability,
        payload: Bytes,
    ) -> Option<ReportBody> {
        self.publish_count.fetch_add(1, Ordering::Relaxed);

        if payload.len() > self.settings.max_payload_bytes {
            debug!(
                "rejecting {} byte payload on '{topic}' from {publisher}",
                payload.len()
            );
            return Some(ReportBody::rejected(ReportStatus::PayloadTooLarge));
        }

        let Some(mut entry) = self.topics.get_mut(topic) else {
            debug!("publish on unknown topic '{topic}' from {publisher}");
            return Some(ReportBody::rejected(ReportStatus::UnknownTopic));
        };
        if !entry.publishers.contains(publisher) {
            debug!("{publisher} is not a registered publisher on '{topic}'");
            return Some(ReportBody::rejected(ReportStatus::UnknownTopic));
        }

        let seq = entry.assign_seq();
        let targets = entry.snapshot_subscribers();

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.store_message(topic, &payload, seq) {
                error!("failed to retain message on '{topic}': {e}");
            }
        }

        if targets.is_empty() {
            // Nobody to deliver to; a reliable publish completes immediately.
            return match reliability {
                Reliability::BestEffort => None,
                Reliability::Reliable => Some(ReportBody::ok(0)),
            };
        }

        let frame = Frame::data(topic, reliability, seq, payload);

        // For reliable delivery the pending entry goes in before any frame
        // leaves, so an early ack always finds it.
        if reliability == Reliability::Reliable {
            let outstanding: HashSet<ClientId> = targets.iter().map(|(id, _)| id.clone()).collect();
            self.pending_acks.insert(
                (topic.to_string(), seq),
                PendingMessage::new(
                    frame.clone(),
                    outstanding,
                    publisher.clone(),
                    corr,
                    targets.len() as u32,
                    Utc::now().timestamp_millis(),
                ),
            );
        }

        let mut gone = Vec::new();
        for (id, sender) in &targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => match reliability {
                    Reliability::BestEffort => {
                        self.dropped_count.fetch_add(1, Ordering::Relaxed);
                        warn!("queue full for {id}, dropping seq {seq} on '{topic}'");
                    }
                    // Left outstanding; the retry sweep will try again.
                    Reliability::Reliable => {}
                },
                Err(TrySendError::Closed(_)) => gone.push(id.clone()),
            }
        }
        drop(entry);

        match reliability {
            Reliability::BestEffort => None,
            Reliability::Reliable => {
                let key = (topic.to_string(), seq);
                let complete = match self.pending_acks.get_mut(&key) {
                    Some(mut pending) => {
                        for id in &gone {
                            pending.outstanding.remove(id);
                        }
                        pending.is_complete()
                    }
                    // An ack raced us and already finished the message.
                    None => return None,
                };
                if complete {
                    self.pending_acks
                        .remove(&key)
                        .map(|(_, pending)| ReportBody::ok(pending.delivered()))
                } else {
                    None
                }
            }
        }
    }

    /// Records an acknowledgment from `from` for (topic, seq); when the last
    /// outstanding subscriber acks, the publisher gets its success report.
    pub fn handle_ack(&self, topic: &str, seq: u64, from: &ClientId) {
        let key = (topic.to_string(), seq);
        let complete = match self.pending_acks.get_mut(&key) {
            Some(mut pending) => {
                pending.outstanding.remove(from);
                pending.is_complete()
            }
            None => {
                debug!("ack for unknown message '{topic}' seq {seq} from {from}");
                return;
            }
        };
        if complete {
            if let Some((_, pending)) = self.pending_acks.remove(&key) {
                self.send_report(
                    &pending.publisher,
                    topic,
                    pending.corr,
                    ReportBody::ok(pending.delivered()),
                );
            }
        }
    }

    /// Cleans up a client by removing it, all its registrations and its
    /// outstanding-ack entries. Used when a connection ends for any reason.
    pub fn cleanup_client(&self, client: &ClientId) {
        self.clients.remove(client);

        let mut unused = Vec::new();
        for mut entry in self.topics.iter_mut() {
            entry.remove_publisher(client);
            entry.remove_subscriber(client);
            if entry.is_unused() {
                unused.push(entry.name.clone());
            }
        }
        for name in unused {
            if self.topics.remove_if(&name, |_, t| t.is_unused()).is_some() {
                info!("topic '{name}' removed");
            }
        }

        self.prune_outstanding(client, None);
        debug!("cleaned up client {client}");
    }

    /// Drops `client` from outstanding-ack sets (for one topic, or all of
    /// them), reporting any messages that thereby complete.
    fn prune_outstanding(&self, client: &ClientId, topic: Option<&str>) {
        let mut completed = Vec::new();
        for mut entry in self.pending_acks.iter_mut() {
            if topic.is_some_and(|t| t != entry.key().0) {
                continue;
            }
            if entry.outstanding.remove(client) && entry.is_complete() {
                completed.push(entry.key().clone());
            }
        }
        for key in completed {
            if let Some((_, pending)) = self.pending_acks.remove(&key) {
                self.send_report(
                    &pending.publisher,
                    &key.0,
                    pending.corr,
                    ReportBody::ok(pending.delivered()),
                );
            }
        }
    }

    fn send_report(&self, to: &ClientId, topic: &str, corr: u64, body: ReportBody) {
        if let Some(client) = self.clients.get(to) {
            if client.sender.try_send(Frame::report(topic, corr, body)).is_err() {
                debug!("could not deliver report to {to}");
            }
        } else {
            debug!("publisher {to} gone before report delivery");
        }
    }

    /// Periodic sweep over the pending-ack table, run as a background task.
    ///
    /// Messages past their ack timeout are re-sent to the outstanding
    /// subscribers; once the retry budget is spent the publisher gets a
    /// timeout report listing how many subscribers never acknowledged.
    pub async fn start_retry_loop(broker: Arc<Broker>) {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_millis(SWEEP_INTERVAL_MS)).await;
            broker.sweep_pending();
        }
    }

    pub(crate) fn sweep_pending(&self) {
        let now = Utc::now().timestamp_millis();
        let mut to_resend = Vec::new();
        let mut to_drop = Vec::new();

        for entry in self.pending_acks.iter() {
            if entry.due(now, self.settings.ack_timeout_ms) {
                if entry.retries >= self.settings.max_retries {
                    to_drop.push(entry.key().clone());
                } else {
                    to_resend.push(entry.key().clone());
                }
            }
        }

        for key in to_drop {
            if let Some((_, pending)) = self.pending_acks.remove(&key) {
                warn!(
                    "reliable message on '{}' seq {} unacknowledged by {} subscriber(s) after {} retries",
                    key.0,
                    key.1,
                    pending.outstanding.len(),
                    pending.retries
                );
                self.send_report(
                    &pending.publisher,
                    &key.0,
                    pending.corr,
                    ReportBody::timeout(pending.delivered(), pending.outstanding.len() as u32),
                );
            }
        }

        for key in to_resend {
            let mut complete = false;
            if let Some(mut pending) = self.pending_acks.get_mut(&key) {
                pending.retries += 1;
                pending.sent_at = now;
                debug!(
                    "re-sending '{}' seq {} to {} outstanding subscriber(s), retry {}",
                    key.0,
                    key.1,
                    pending.outstanding.len(),
                    pending.retries
                );

                let mut gone = Vec::new();
                for id in pending.outstanding.iter() {
                    match self.clients.get(id) {
                        Some(client) => {
                            // A full queue stays outstanding for the next sweep.
                            if let Err(TrySendError::Closed(_)) =
                                client.sender.try_send(pending.frame.clone())
                            {
                                gone.push(id.clone());
                            }
                        }
                        None => gone.push(id.clone()),
                    }
                }
                for id in gone {
                    pending.outstanding.remove(&id);
                }
                complete = pending.is_complete();
            }
            if complete {
                if let Some((_, pending)) = self.pending_acks.remove(&key) {
                    self.send_report(
                        &pending.publisher,
                        &key.0,
                        pending.corr,
                        ReportBody::ok(pending.delivered()),
                    );
                }
            }
        }
    }
}
