//! # mmw
//!
//! `mmw` is a topic-based publish/subscribe messaging core built with Rust.
//! It ships a broker process and a client library speaking a framed
//! little-endian TCP protocol, with two delivery levels selectable per
//! publish call: best-effort and acknowledgment-tracked reliable delivery.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: the delivery engine managing topics, subscriber fan-out,
//!   acknowledgment tracking and retries.
//! - `client`: the session lifecycle, publisher/subscriber handles,
//!   connection management with reconnection, and callback dispatch.
//! - `config`: loading and merging server, broker and client settings.
//! - `persistence`: the retained-message store used for replay to new
//!   subscribers.
//! - `transport`: the wire format and the broker's TCP server.
//! - `utils`: shared error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use broker::engine::Broker;
pub use broker::message::{Message, Reliability};
pub use client::blocking::BlockingSession;
pub use client::dispatch::MessageHandler;
pub use client::handles::{PublisherHandle, SubscriberHandle};
pub use client::session::{Discovery, PublishReceipt, Session};
pub use config::{Settings, load_config};
pub use persistence::Persistence;
pub use transport::tcp::start_broker_server;
pub use utils::error::{MmwError, Result};
