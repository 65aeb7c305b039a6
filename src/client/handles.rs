//! User-facing publisher and subscriber lifecycle handles.
//!
//! Handles are thin RAII wrappers over the session's registration state:
//! closing (or dropping) the last handle on a topic unregisters it from the
//! broker. Double-close is a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;

use crate::broker::message::Reliability;
use crate::client::dispatch::SubEntry;
use crate::client::session::{PublishReceipt, Session};
use crate::transport::frame::Frame;
use crate::utils::error::{MmwError, Result};

/// A registered publisher bound to one topic.
pub struct PublisherHandle {
    session: Session,
    topic: String,
    closed: AtomicBool,
}

impl std::fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl PublisherHandle {
    pub(crate) fn new(session: Session, topic: String) -> Self {
        Self {
            session,
            topic,
            closed: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes on this handle's topic.
    pub async fn publish(
        &self,
        payload: impl Into<Bytes>,
        reliability: Reliability,
    ) -> Result<PublishReceipt> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MmwError::NotInitialized);
        }
        self.session.publish(&self.topic, payload, reliability).await
    }

    /// Unregisters this handle. Closing twice is a no-op.
    pub fn close(&self) {
        self.release();
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Session cleanup already unregistered everything
        if self.session.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.session.inner.registry.remove_publisher(&self.topic) {
            let _ = self
                .session
                .inner
                .conn
                .send(Frame::unregister(&self.topic, false));
        }
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// A registered subscription bound to one topic.
pub struct SubscriberHandle {
    session: Session,
    topic: String,
    entry: Arc<SubEntry>,
    closed: AtomicBool,
}

impl SubscriberHandle {
    pub(crate) fn new(session: Session, topic: String, entry: Arc<SubEntry>) -> Self {
        Self {
            session,
            topic,
            entry,
            closed: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Closes the subscription and joins its dispatch task: once this
    /// returns, the callback will not be invoked again, even for messages
    /// that were already queued. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Detach from routing first so nothing new is queued
        self.session.inner.dispatcher.remove(&self.entry);
        let grace = Duration::from_millis(self.session.inner.settings.client.shutdown_grace_ms);
        self.entry.stop(grace).await;
        self.unregister();
        Ok(())
    }

    fn unregister(&self) {
        if self.session.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.session.inner.registry.remove_subscriber(&self.topic) {
            let _ = self
                .session
                .inner
                .conn
                .send(Frame::unregister(&self.topic, true));
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Cannot join from a sync drop; cancel and unregister opportunistically
        self.session.inner.dispatcher.remove(&self.entry);
        self.entry.abort();
        self.unregister();
    }
}
