//! # cmdlink-core
//!
//! Shared library for cmdlink containing the command envelope model, the
//! wire codec, the connection runtime, and per-peer bookkeeping (identity,
//! session ids, clock drift).
//!
//! This crate is used by both the server and client runtimes.
//!
//! # Architecture overview (for beginners)
//!
//! cmdlink multiplexes typed commands over one persistent TCP connection per
//! peer. A command is a code (like `"print"`) plus one payload; the side
//! that receives it looks the code up in its command registry and runs the
//! registered handler. Everything else in the system exists to move those
//! commands reliably.
//!
//! This crate (`cmdlink-core`) is the shared foundation. It defines:
//!
//! - **`protocol`** – How bytes travel over the network. An envelope (id,
//!   code, payload kind, data) is serialized into one UTF-8 string and sent
//!   behind a 4-byte length prefix. Binary payloads ride as base64 text so
//!   the frame stays valid UTF-8, and a fixed set of `sys/` codes is
//!   reserved for the runtime's own handshake and shutdown traffic.
//!
//! - **`runtime`** – One [`Link`] per TCP connection: a reader task decodes
//!   inbound frames and dispatches them through a [`CommandRegistry`], and
//!   writes are serialized so concurrent senders never interleave partial
//!   frames. Outbound values collect in a [`StagingBuffer`] until a send
//!   drains them into a single envelope.
//!
//! - **`session`** – What a server remembers about each connected client:
//!   the reported OS identity, the assigned integer id, and a running
//!   clock-offset estimate refined from repeated samples.

pub mod protocol;
pub mod runtime;
pub mod session;

// Re-export the most-used types at the crate root so callers can write
// `cmdlink_core::CommandEnvelope` instead of the full module path.
pub use protocol::codec::{decode_envelope, encode_envelope, CodecError, MAX_FRAME_LEN};
pub use protocol::codes::ReservedCode;
pub use protocol::envelope::{Command, CommandEnvelope, Payload, PayloadKind};
pub use runtime::link::{ConnectError, Link, LinkError, LinkHooks, LinkState};
pub use runtime::registry::{CommandRegistry, RegistryError};
pub use runtime::staging::{StagedValue, StagingBuffer};
pub use session::drift::{wall_clock_nanos, DriftTracker};
pub use session::identity::ClientIdentity;
pub use session::ids::{ClientId, IdAllocator};
