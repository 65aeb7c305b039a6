//! The `client` module is the user-facing side of the messaging system.
//!
//! It provides the `Session` lifecycle (initialize/cleanup), publisher and
//! subscriber handles, the connection manager that keeps the broker link
//! alive, and the dispatch machinery that delivers messages to callbacks.

pub mod blocking;
pub mod connection;
pub mod dispatch;
pub mod handles;
pub mod session;

pub use session::Session;

#[cfg(test)]
mod tests;
