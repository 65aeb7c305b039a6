//! Blocking entry points for callers without an async runtime.
//!
//! `BlockingSession` owns its own runtime and mirrors the async `Session`
//! API one call at a time; a reliable publish blocks the calling thread up
//! to the retry/timeout budget instead of returning a future.

use bytes::Bytes;

use crate::broker::message::Reliability;
use crate::client::dispatch::MessageHandler;
use crate::client::handles::{PublisherHandle, SubscriberHandle};
use crate::client::session::{Discovery, PublishReceipt, Session};
use crate::utils::error::Result;

/// A messaging session for synchronous callers.
pub struct BlockingSession {
    runtime: tokio::runtime::Runtime,
    session: Session,
}

impl BlockingSession {
    /// Establishes the session, blocking until connected.
    pub fn initialize(discovery: Discovery) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let session = runtime.block_on(Session::initialize(discovery))?;
        Ok(Self { runtime, session })
    }

    pub fn create_publisher(&self, topic: &str) -> Result<PublisherHandle> {
        self.runtime.block_on(self.session.create_publisher(topic))
    }

    pub fn create_subscriber(
        &self,
        topic: &str,
        handler: impl MessageHandler,
    ) -> Result<SubscriberHandle> {
        self.runtime
            .block_on(self.session.create_subscriber(topic, handler))
    }

    /// Publishes, blocking for the delivery report when `reliability` is
    /// `Reliable`.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        reliability: Reliability,
    ) -> Result<PublishReceipt> {
        self.runtime
            .block_on(self.session.publish(topic, payload, reliability))
    }

    /// Closes a subscription, blocking until its dispatch task has stopped.
    pub fn close_subscriber(&self, handle: &SubscriberHandle) -> Result<()> {
        self.runtime.block_on(handle.close())
    }

    /// Tears the session down. Idempotent.
    pub fn cleanup(&self) -> Result<()> {
        self.runtime.block_on(self.session.cleanup())
    }

    /// The underlying async session, for mixed callers.
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for BlockingSession {
    fn drop(&mut self) {
        let _ = self.runtime.block_on(self.session.cleanup());
    }
}
