//! Subscriber dispatch.
//!
//! Each subscription owns a bounded delivery queue drained by a dedicated
//! task that invokes the user callback. The connection reader routes incoming
//! messages into every local subscription queue for the topic; per-
//! subscription sequence tracking drops retry duplicates and keeps callback
//! order strictly increasing. A panicking callback is caught and logged so
//! one misbehaving subscriber cannot stall the dispatch task.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::broker::message::Message;

/// User-supplied message callback.
///
/// Closures get a blanket implementation, so
/// `session.create_subscriber("news", |msg: Message| ...)` just works;
/// implement the trait directly for stateful subscribers.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn on_message(&self, message: Message) {
        self(message)
    }
}

/// One local subscription: its delivery queue plus the dispatch task state.
pub(crate) struct SubEntry {
    pub id: Uuid,
    pub topic: String,
    tx: mpsc::Sender<Message>,
    last_seq: AtomicU64,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubEntry {
    /// Stops the dispatch task and waits for it to finish, so no callback
    /// runs after this returns. Tasks that outlive the grace period are
    /// force-cancelled.
    pub(crate) async fn stop(&self, grace: Duration) {
        self.shutdown.notify_one();
        let handle = self.task.lock().expect("dispatch task lock poisoned").take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("dispatch task for '{}' exceeded grace period, aborting", self.topic);
                handle.abort();
            }
        }
    }

    /// Drop-path variant: cancels without waiting.
    pub(crate) fn abort(&self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.task.lock().expect("dispatch task lock poisoned").take() {
            handle.abort();
        }
    }
}

/// Whether an incoming message reached every local queue, used to decide
/// acknowledgment for reliable frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    NoSubscribers,
    Delivered,
    Partial,
}

/// Routes incoming messages to the local subscriptions of each topic.
pub(crate) struct Dispatcher {
    topics: DashMap<String, Vec<Arc<SubEntry>>>,
    queue_capacity: usize,
    /// Deliveries dropped because a subscription queue was full.
    pub dropped_count: AtomicUsize,
}

impl Dispatcher {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            queue_capacity,
            dropped_count: AtomicUsize::new(0),
        }
    }

    /// Creates a subscription on `topic` and spawns its dispatch task.
    pub fn add(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Arc<SubEntry> {
        let (tx, mut rx) = mpsc::channel::<Message>(self.queue_capacity);
        let shutdown = Arc::new(Notify::new());
        let entry = Arc::new(SubEntry {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            tx,
            last_seq: AtomicU64::new(0),
            shutdown: shutdown.clone(),
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => break,
                    maybe = rx.recv() => match maybe {
                        Some(message) => {
                            let result =
                                catch_unwind(AssertUnwindSafe(|| handler.on_message(message)));
                            if result.is_err() {
                                error!("subscriber callback panicked; continuing with next message");
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        *entry.task.lock().expect("dispatch task lock poisoned") = Some(handle);

        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(entry.clone());
        entry
    }

    /// Detaches a subscription so no further messages are routed to it.
    pub fn remove(&self, entry: &Arc<SubEntry>) {
        if let Some(mut subs) = self.topics.get_mut(&entry.topic) {
            subs.retain(|e| e.id != entry.id);
            let empty = subs.is_empty();
            drop(subs);
            if empty {
                self.topics.remove_if(&entry.topic, |_, subs| subs.is_empty());
            }
        }
    }

    /// Hands an incoming message to every local subscription on its topic.
    ///
    /// Messages at or below a subscription's last seen sequence are retry
    /// duplicates and count as delivered without another callback.
    pub fn route(&self, message: &Message) -> RouteOutcome {
        let Some(subs) = self.topics.get(&message.topic) else {
            return RouteOutcome::NoSubscribers;
        };
        if subs.is_empty() {
            return RouteOutcome::NoSubscribers;
        }

        let mut all_enqueued = true;
        for entry in subs.iter() {
            let last = entry.last_seq.load(Ordering::Acquire);
            if message.sequence <= last {
                debug!(
                    "duplicate seq {} on '{}' ignored",
                    message.sequence, message.topic
                );
                continue;
            }
            match entry.tx.try_send(message.clone()) {
                Ok(()) => entry.last_seq.store(message.sequence, Ordering::Release),
                Err(TrySendError::Full(_)) => {
                    self.dropped_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "dispatch queue full, dropping seq {} on '{}'",
                        message.sequence, message.topic
                    );
                    all_enqueued = false;
                }
                // Subscription is shutting down; nothing to deliver to.
                Err(TrySendError::Closed(_)) => {}
            }
        }

        if all_enqueued {
            RouteOutcome::Delivered
        } else {
            RouteOutcome::Partial
        }
    }

    /// All live subscriptions, for session teardown.
    pub fn entries(&self) -> Vec<Arc<SubEntry>> {
        self.topics
            .iter()
            .flat_map(|subs| subs.value().clone())
            .collect()
    }
}
