//! Messaging session lifecycle and the user-facing publish API.
//!
//! A `Session` is an explicit object rather than ambient global state: it is
//! created by `initialize`, passed around by cheap clones, and torn down by
//! `cleanup`. One process may hold at most one live session at a time; a
//! second `initialize` without an intervening `cleanup` fails with
//! `AlreadyInitialized`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::broker::message::Reliability;
use crate::client::connection::{CONNECT_TIMEOUT, ConnectionHandle, spawn_connection};
use crate::client::dispatch::{Dispatcher, MessageHandler};
use crate::client::handles::{PublisherHandle, SubscriberHandle};
use crate::config::{Settings, load_config};
use crate::transport::frame::{Frame, ReportStatus};
use crate::utils::error::{MmwError, Result};

/// At most one live session per process.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// How the session finds its broker. Exactly one discovery mode applies per
/// session; the variants make mixing unrepresentable.
#[derive(Debug, Clone)]
pub enum Discovery {
    /// Connect straight to `host:port`, with stock settings for everything
    /// else.
    Endpoint { host: String, port: u16 },
    /// Load the endpoint and tuning from a configuration file.
    ConfigFile(PathBuf),
}

/// What a `publish` call can promise once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReceipt {
    /// Best-effort: the message was accepted by the send queue.
    Sent,
    /// Reliable: the broker's final delivery report. `failed` is non-zero
    /// when the retry budget ran out before every subscriber acknowledged;
    /// the message was still sent, just not globally confirmed.
    Acknowledged { delivered: u32, failed: u32 },
}

impl PublishReceipt {
    /// True when nothing is known to be missing: best-effort hand-off, or a
    /// reliable publish every subscriber acknowledged.
    pub fn complete(&self) -> bool {
        match self {
            PublishReceipt::Sent => true,
            PublishReceipt::Acknowledged { failed, .. } => *failed == 0,
        }
    }
}

/// Per-topic registration counts local to this session.
///
/// Multiple handles on one topic collapse into a single wire registration;
/// the first handle registers with the broker and the last close unregisters.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    topics: DashMap<String, TopicRegistration>,
}

#[derive(Debug, Default, Clone, Copy)]
struct TopicRegistration {
    publishers: usize,
    subscribers: usize,
}

/// Snapshot row used for re-registration and teardown.
pub(crate) struct WireRegistration {
    pub topic: String,
    pub publisher: bool,
    pub subscriber: bool,
}

impl Registry {
    /// Counts a publisher handle; true when this is the topic's first one.
    pub fn add_publisher(&self, topic: &str) -> bool {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        entry.publishers += 1;
        entry.publishers == 1
    }

    /// Uncounts a publisher handle; true when it was the topic's last one.
    pub fn remove_publisher(&self, topic: &str) -> bool {
        let Some(mut entry) = self.topics.get_mut(topic) else {
            return false;
        };
        if entry.publishers == 0 {
            return false;
        }
        entry.publishers -= 1;
        let last = entry.publishers == 0;
        let unused = last && entry.subscribers == 0;
        drop(entry);
        if unused {
            self.topics
                .remove_if(topic, |_, r| r.publishers == 0 && r.subscribers == 0);
        }
        last
    }

    /// Counts a subscription; true when this is the topic's first one.
    pub fn add_subscriber(&self, topic: &str) -> bool {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        entry.subscribers += 1;
        entry.subscribers == 1
    }

    /// Uncounts a subscription; true when it was the topic's last one.
    pub fn remove_subscriber(&self, topic: &str) -> bool {
        let Some(mut entry) = self.topics.get_mut(topic) else {
            return false;
        };
        if entry.subscribers == 0 {
            return false;
        }
        entry.subscribers -= 1;
        let last = entry.subscribers == 0;
        let unused = last && entry.publishers == 0;
        drop(entry);
        if unused {
            self.topics
                .remove_if(topic, |_, r| r.publishers == 0 && r.subscribers == 0);
        }
        last
    }

    pub fn has_publisher(&self, topic: &str) -> bool {
        self.topics.get(topic).is_some_and(|r| r.publishers > 0)
    }

    /// Live registrations, one row per topic.
    pub fn wire_registrations(&self) -> Vec<WireRegistration> {
        self.topics
            .iter()
            .map(|entry| WireRegistration {
                topic: entry.key().clone(),
                publisher: entry.publishers > 0,
                subscriber: entry.subscribers > 0,
            })
            .collect()
    }

    /// Takes every registration, leaving the registry empty.
    pub fn drain(&self) -> Vec<WireRegistration> {
        let rows = self.wire_registrations();
        self.topics.clear();
        rows
    }
}

pub(crate) struct SessionInner {
    pub(crate) conn: ConnectionHandle,
    pub(crate) registry: Arc<Registry>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) settings: Settings,
    pub(crate) closed: AtomicBool,
}

/// A live messaging session. Cloning is cheap and shares the underlying
/// connection.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Establishes the process-wide messaging session.
    ///
    /// Fails with `AlreadyInitialized` when a live session already exists,
    /// `Config` when the configuration file is unusable, and `Connection`
    /// when the broker endpoint cannot be reached.
    pub async fn initialize(discovery: Discovery) -> Result<Session> {
        let settings = match &discovery {
            Discovery::Endpoint { host, port } => {
                let mut settings = Settings::default();
                settings.server.host = host.clone();
                settings.server.port = *port;
                settings
            }
            Discovery::ConfigFile(path) => load_config(Some(path.as_path()))?,
        };

        if SESSION_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(MmwError::AlreadyInitialized);
        }

        let endpoint = format!("{}:{}", settings.server.host, settings.server.port);
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                SESSION_ACTIVE.store(false, Ordering::SeqCst);
                return Err(MmwError::Connection(format!(
                    "cannot reach broker at {endpoint}: {e}"
                )));
            }
            Err(_) => {
                SESSION_ACTIVE.store(false, Ordering::SeqCst);
                return Err(MmwError::Connection(format!(
                    "timed out connecting to broker at {endpoint}"
                )));
            }
        };
        info!("connected to broker at {endpoint}");

        let registry = Arc::new(Registry::default());
        let dispatcher = Arc::new(Dispatcher::new(settings.client.dispatch_queue_capacity));
        let conn = spawn_connection(
            stream,
            endpoint,
            settings.client.clone(),
            dispatcher.clone(),
            registry.clone(),
        );

        Ok(Session {
            inner: Arc::new(SessionInner {
                conn,
                registry,
                dispatcher,
                settings,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(MmwError::NotInitialized)
        } else {
            Ok(())
        }
    }

    fn check_topic(topic: &str) -> Result<()> {
        if topic.len() > u16::MAX as usize {
            Err(MmwError::Frame("topic name too long".into()))
        } else {
            Ok(())
        }
    }

    /// Registers this session as a publisher on `topic` and returns the
    /// handle. The broker confirms the registration before this returns.
    pub async fn create_publisher(&self, topic: &str) -> Result<PublisherHandle> {
        self.ensure_open()?;
        Self::check_topic(topic)?;

        if self.inner.registry.add_publisher(topic) {
            if let Err(e) = self.confirm_registration(topic, false).await {
                self.inner.registry.remove_publisher(topic);
                return Err(e);
            }
        }
        Ok(PublisherHandle::new(self.clone(), topic.to_string()))
    }

    /// Registers a subscription on `topic`, delivering messages to `handler`
    /// on a dedicated dispatch task. The broker confirms the registration
    /// (and replays any retained backlog) before this returns.
    pub async fn create_subscriber(
        &self,
        topic: &str,
        handler: impl MessageHandler,
    ) -> Result<SubscriberHandle> {
        self.ensure_open()?;
        Self::check_topic(topic)?;

        // The local queue goes in first so replayed messages have somewhere
        // to land.
        let entry = self.inner.dispatcher.add(topic, Arc::new(handler));

        if self.inner.registry.add_subscriber(topic) {
            if let Err(e) = self.confirm_registration(topic, true).await {
                self.inner.registry.remove_subscriber(topic);
                self.inner.dispatcher.remove(&entry);
                entry.abort();
                return Err(e);
            }
        }
        Ok(SubscriberHandle::new(self.clone(), topic.to_string(), entry))
    }

    async fn confirm_registration(&self, topic: &str, subscriber_role: bool) -> Result<()> {
        let corr = self.inner.conn.next_corr();
        let rx = self.inner.conn.expect_report(corr);
        let frame = if subscriber_role {
            Frame::register_subscriber(topic, corr)
        } else {
            Frame::register_publisher(topic, corr)
        };
        if let Err(e) = self.inner.conn.send(frame) {
            self.inner.conn.abandon_report(corr);
            return Err(e);
        }

        let wait = Duration::from_millis(self.inner.settings.client.ack_wait_ms);
        match timeout(wait, rx).await {
            Ok(Ok(body)) if body.status == ReportStatus::Ok => Ok(()),
            Ok(Ok(body)) => Err(MmwError::Connection(format!(
                "broker rejected registration on '{topic}': {:?}",
                body.status
            ))),
            Ok(Err(_)) => Err(MmwError::Connection(
                "link lost while awaiting registration confirm".into(),
            )),
            Err(_) => {
                self.inner.conn.abandon_report(corr);
                Err(MmwError::Connection(format!(
                    "no registration confirm for '{topic}' within {} ms",
                    self.inner.settings.client.ack_wait_ms
                )))
            }
        }
    }

    /// Publishes `payload` on `topic` with the requested reliability.
    ///
    /// Best-effort returns as soon as the frame is queued. Reliable resolves
    /// once the broker reports the outcome of acknowledgment tracking; a
    /// partial delivery comes back as a receipt with `failed > 0`, not an
    /// error, since the message itself was sent.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        reliability: Reliability,
    ) -> Result<PublishReceipt> {
        self.ensure_open()?;
        Self::check_topic(topic)?;

        let payload = payload.into();
        let limit = self.inner.settings.broker.max_payload_bytes;
        if payload.len() > limit {
            return Err(MmwError::PayloadTooLarge { size: payload.len(), limit });
        }
        if !self.inner.registry.has_publisher(topic) {
            return Err(MmwError::UnknownTopic(topic.to_string()));
        }

        match reliability {
            Reliability::BestEffort => {
                self.inner
                    .conn
                    .send(Frame::data(topic, reliability, 0, payload))?;
                Ok(PublishReceipt::Sent)
            }
            Reliability::Reliable => {
                let payload_len = payload.len();
                let corr = self.inner.conn.next_corr();
                let rx = self.inner.conn.expect_report(corr);
                if let Err(e) = self
                    .inner
                    .conn
                    .send(Frame::data(topic, reliability, corr, payload))
                {
                    self.inner.conn.abandon_report(corr);
                    return Err(e);
                }

                let wait_ms = self.inner.settings.client.ack_wait_ms;
                match timeout(Duration::from_millis(wait_ms), rx).await {
                    Ok(Ok(body)) => match body.status {
                        ReportStatus::Ok => Ok(PublishReceipt::Acknowledged {
                            delivered: body.delivered,
                            failed: body.failed,
                        }),
                        ReportStatus::Timeout => {
                            warn!(
                                "reliable publish on '{topic}' unacknowledged by {} subscriber(s)",
                                body.failed
                            );
                            Ok(PublishReceipt::Acknowledged {
                                delivered: body.delivered,
                                failed: body.failed,
                            })
                        }
                        ReportStatus::UnknownTopic => Err(MmwError::UnknownTopic(topic.to_string())),
                        ReportStatus::PayloadTooLarge => {
                            Err(MmwError::PayloadTooLarge { size: payload_len, limit })
                        }
                    },
                    Ok(Err(_)) => Err(MmwError::Connection(
                        "link lost while awaiting delivery report".into(),
                    )),
                    Err(_) => {
                        self.inner.conn.abandon_report(corr);
                        Err(MmwError::DeliveryTimeout { waited_ms: wait_ms })
                    }
                }
            }
        }
    }

    /// Tears the session down: stops every dispatch task (with the configured
    /// grace period), unregisters from the broker, abandons pending reliable
    /// waits and stops the connection actor. Idempotent; afterwards a new
    /// `initialize` starts from a clean slate.
    pub async fn cleanup(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let grace = Duration::from_millis(self.inner.settings.client.shutdown_grace_ms);
        let entries = self.inner.dispatcher.entries();
        join_all(entries.iter().map(|entry| entry.stop(grace))).await;
        for entry in &entries {
            self.inner.dispatcher.remove(entry);
        }

        // Polite unregisters; the broker also cleans up on disconnect.
        for registration in self.inner.registry.drain() {
            if registration.publisher {
                let _ = self.inner.conn.send(Frame::unregister(&registration.topic, false));
            }
            if registration.subscriber {
                let _ = self.inner.conn.send(Frame::unregister(&registration.topic, true));
            }
        }

        self.inner.conn.fail_pending();
        self.inner.conn.stop();
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
        info!("messaging session closed");
        Ok(())
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.conn.stop();
            SESSION_ACTIVE.store(false, Ordering::SeqCst);
        }
    }
}
