//! # cmdlink-server
//!
//! Server runtime for the cmdlink command protocol.
//!
//! A [`CommandServer`] accepts inbound connections, promotes each one to a
//! [`ClientSession`] once its introduce handshake arrives, and offers
//! unicast and broadcast sends addressed by server-assigned session id. Per
//! session it keeps the client's reported OS identity and a running
//! clock-offset estimate.

pub mod config;
pub mod server;
pub mod session;

pub use config::{AppConfig, ConfigError};
pub use server::{CommandServer, ServerError};
pub use session::ClientSession;
