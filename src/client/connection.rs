//! Client connection manager.
//!
//! One connection actor per session owns the link to the broker: it drains
//! the bounded send queue into the socket, watches the frame reader for link
//! loss, and runs the reconnection loop (exponential backoff with jitter,
//! then re-registration of every live publisher and subscriber). The frame
//! reader routes `Data` frames into subscriber dispatch and resolves
//! `Report` frames against the pending-report table.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::broker::message::{Message, Reliability};
use crate::client::dispatch::{Dispatcher, RouteOutcome};
use crate::client::session::Registry;
use crate::config::ClientSettings;
use crate::transport::frame::{
    Frame, FrameKind, MAX_FRAME_PAYLOAD, ReportBody, read_frame, write_frame,
};
use crate::utils::error::{MmwError, Result};

/// Budget for a single connect attempt.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Session-side handle to the connection actor.
pub(crate) struct ConnectionHandle {
    out_tx: mpsc::Sender<Frame>,
    pending_reports: Arc<DashMap<u64, oneshot::Sender<ReportBody>>>,
    corr: AtomicU64,
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    /// Next correlation id for a frame that expects a `Report`.
    pub fn next_corr(&self) -> u64 {
        self.corr.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues a frame for sending. Fails with `Backpressure` when the send
    /// queue is full (for example while the link is down and the buffer has
    /// filled up).
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.out_tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => MmwError::Backpressure,
            TrySendError::Closed(_) => MmwError::NotInitialized,
        })
    }

    /// Registers interest in the report for `corr`.
    pub fn expect_report(&self, corr: u64) -> oneshot::Receiver<ReportBody> {
        let (tx, rx) = oneshot::channel();
        self.pending_reports.insert(corr, tx);
        rx
    }

    /// Drops the interest registered with [`expect_report`].
    pub fn abandon_report(&self, corr: u64) {
        self.pending_reports.remove(&corr);
    }

    /// Abandons every pending report wait. Used at teardown so reliable
    /// publishes fail fast instead of waiting out their budget.
    pub fn fail_pending(&self) {
        self.pending_reports.clear();
    }

    /// Asks the actor to stop; idempotent.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

/// Spawns the connection actor on an established stream and returns the
/// session-side handle.
pub(crate) fn spawn_connection(
    stream: TcpStream,
    endpoint: String,
    settings: ClientSettings,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
) -> ConnectionHandle {
    let (out_tx, out_rx) = mpsc::channel::<Frame>(settings.send_queue_capacity);
    let pending_reports: Arc<DashMap<u64, oneshot::Sender<ReportBody>>> = Arc::new(DashMap::new());
    let shutdown = Arc::new(Notify::new());

    let actor = ConnectionActor {
        endpoint,
        settings,
        dispatcher,
        registry,
        pending_reports: pending_reports.clone(),
        shutdown: shutdown.clone(),
        out_rx,
        ack_tx: out_tx.clone(),
    };
    tokio::spawn(actor.run(stream));

    ConnectionHandle {
        out_tx,
        pending_reports,
        corr: AtomicU64::new(1),
        shutdown,
    }
}

struct ConnectionActor {
    endpoint: String,
    settings: ClientSettings,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
    pending_reports: Arc<DashMap<u64, oneshot::Sender<ReportBody>>>,
    shutdown: Arc<Notify>,
    out_rx: mpsc::Receiver<Frame>,
    ack_tx: mpsc::Sender<Frame>,
}

impl ConnectionActor {
    async fn run(mut self, mut stream: TcpStream) {
        loop {
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = tokio::spawn(read_loop(
                read_half,
                self.dispatcher.clone(),
                self.pending_reports.clone(),
                self.ack_tx.clone(),
            ));

            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        reader.abort();
                        return;
                    }
                    _ = &mut reader => break,
                    maybe = self.out_rx.recv() => match maybe {
                        Some(frame) => {
                            if write_frame(&mut write_half, &frame).await.is_err() {
                                reader.abort();
                                break;
                            }
                        }
                        // Session state dropped without cleanup
                        None => {
                            reader.abort();
                            return;
                        }
                    },
                }
            }

            // Reliable publishes waiting on the dead link fail fast rather
            // than waiting out their budget.
            self.pending_reports.clear();

            stream = match self.reconnect().await {
                Some(stream) => stream,
                None => return,
            };
        }
    }

    /// Reconnection loop: exponential backoff from the configured base up to
    /// the cap, with ±20 % jitter, until a connect succeeds and the live
    /// registrations are re-established.
    async fn reconnect(&mut self) -> Option<TcpStream> {
        let mut delay = self.settings.reconnect_base_ms.max(1);
        loop {
            let wait = jittered(delay);
            warn!("link to {} lost; retrying in {} ms", self.endpoint, wait);
            tokio::select! {
                _ = self.shutdown.notified() => return None,
                _ = sleep(Duration::from_millis(wait)) => {}
            }

            match timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.endpoint)).await {
                Ok(Ok(mut stream)) => {
                    if self.reregister(&mut stream).await {
                        info!("reconnected to {}", self.endpoint);
                        return Some(stream);
                    }
                }
                Ok(Err(e)) => debug!("reconnect to {} failed: {e}", self.endpoint),
                Err(_) => debug!("reconnect to {} timed out", self.endpoint),
            }
            delay = (delay * 2).min(self.settings.reconnect_cap_ms);
        }
    }

    /// Replays the session's live registrations on a fresh stream, ahead of
    /// any frames still queued from before the drop.
    async fn reregister(&self, stream: &mut TcpStream) -> bool {
        for registration in self.registry.wire_registrations() {
            if registration.publisher
                && write_frame(stream, &Frame::register_publisher(&registration.topic, 0))
                    .await
                    .is_err()
            {
                return false;
            }
            if registration.subscriber
                && write_frame(stream, &Frame::register_subscriber(&registration.topic, 0))
                    .await
                    .is_err()
            {
                return false;
            }
        }
        true
    }
}

fn jittered(ms: u64) -> u64 {
    (ms as f64 * (0.8 + fastrand::f64() * 0.4)) as u64
}

/// Reads frames off the broker link until it breaks, routing data into
/// subscriber dispatch and reports to their waiters. Acks go out through the
/// regular send queue once a reliable message reached every local queue.
async fn read_loop(
    mut read_half: OwnedReadHalf,
    dispatcher: Arc<Dispatcher>,
    pending_reports: Arc<DashMap<u64, oneshot::Sender<ReportBody>>>,
    ack_tx: mpsc::Sender<Frame>,
) {
    loop {
        match read_frame(&mut read_half, MAX_FRAME_PAYLOAD).await {
            Ok(frame) => match frame.kind {
                FrameKind::Data => {
                    let reliability = frame.reliability;
                    let message = Message::new(frame.topic, frame.payload, frame.seq, reliability);
                    let outcome = dispatcher.route(&message);
                    if reliability == Reliability::Reliable && outcome == RouteOutcome::Delivered {
                        if ack_tx
                            .try_send(Frame::ack(&message.topic, message.sequence))
                            .is_err()
                        {
                            debug!(
                                "ack for '{}' seq {} dropped, send queue full",
                                message.topic, message.sequence
                            );
                        }
                    }
                }
                FrameKind::Report => match pending_reports.remove(&frame.seq) {
                    Some((_, tx)) => match ReportBody::decode(&frame.payload) {
                        Ok(body) => {
                            let _ = tx.send(body);
                        }
                        Err(e) => warn!("undecodable report from broker: {e}"),
                    },
                    // Re-registration confirms arrive with correlation 0
                    None => debug!("report with no waiter (corr {})", frame.seq),
                },
                other => debug!("unexpected {other:?} frame from broker"),
            },
            Err(e) => {
                debug!("broker link read ended: {e}");
                return;
            }
        }
    }
}
