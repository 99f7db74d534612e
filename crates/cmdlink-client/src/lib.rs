//! # cmdlink-client
//!
//! Client runtime for the cmdlink command protocol.
//!
//! A [`CommandClient`] owns one connection to a cmdlink server: it connects
//! with a bounded timeout, introduces itself, stages outgoing values, and
//! sends commands either synchronously, fire-and-forget with an async
//! acknowledgment, or blocking until the acknowledgment resolves.

pub mod client;
pub mod config;

pub use client::{CommandClient, SendError};
pub use config::ClientConfig;
