//! One TCP connection and its reader task.
//!
//! A [`Link`] owns the write half of a socket plus a reader task that turns
//! inbound bytes into decoded envelopes and dispatches them through the
//! registry the link was built with. The client runtime owns exactly one
//! link; the server owns one per accepted client.
//!
//! # Lifecycle
//!
//! `Connecting → Connected → Disconnected`, with `Disconnected` terminal: a
//! link is never reused after teardown. The owning runtime observes the
//! lifecycle through [`LinkHooks`]; every teardown path (local close, peer
//! EOF, read error, unrecoverable frame) fires `on_closed` exactly once.
//!
//! # Why the reader starts gated (for beginners)
//!
//! The reader task is spawned before the connected hook runs but waits on a
//! one-shot start signal that is sent only after the hook returns. The hook
//! may therefore write to the brand-new connection (the socket is live), and
//! whatever bookkeeping it performs cannot race the first inbound dispatch;
//! bytes that arrive in the meantime simply wait in the kernel's socket
//! buffer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::protocol::codec::{self, CodecError};
use crate::protocol::envelope::CommandEnvelope;
use crate::runtime::registry::CommandRegistry;
use crate::session::ids::ClientId;

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures surfaced synchronously from [`Link::connect`].
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The deadline elapsed before the TCP handshake completed.
    #[error("connecting to {addr} timed out after {timeout:?}")]
    TimedOut { addr: String, timeout: Duration },

    /// The peer is reachable but nothing is listening on the port.
    #[error("connection to {addr} was refused")]
    Refused {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Name resolution failed or the host could not be reached at all.
    #[error("failed to reach {addr}")]
    Unreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures surfaced from [`Link::send`].
#[derive(Debug, Error)]
pub enum LinkError {
    /// The link already reached `Disconnected`.
    #[error("link is disconnected")]
    Closed,

    /// The envelope could not be serialized.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The socket write itself failed.
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

// ── Lifecycle hooks ───────────────────────────────────────────────────────────

/// Lifecycle callbacks owned by whichever runtime created the link.
///
/// Every method defaults to a no-op so implementors only override what they
/// observe. `on_disconnecting` runs only for a deliberate local close, while
/// the socket can still carry a final frame; `on_bad_frame` and
/// `on_io_error` run on the reader task and are suppressed once the link is
/// no longer connected (a locally closed socket is not a peer error).
#[async_trait]
pub trait LinkHooks: Send + Sync {
    /// The link is connected and its reader exists; dispatch has not begun.
    async fn on_connected(&self, link: &Arc<Link>) {
        let _ = link;
    }

    /// A deliberate local close is about to tear the socket down.
    async fn on_disconnecting(&self, link: &Arc<Link>) {
        let _ = link;
    }

    /// The link reached `Disconnected`. Fired exactly once per link.
    async fn on_closed(&self, link: &Arc<Link>) {
        let _ = link;
    }

    /// An inbound frame could not be decoded; the connection survives unless
    /// stream alignment was lost.
    fn on_bad_frame(&self, link: &Arc<Link>, error: &CodecError) {
        let _ = (link, error);
    }

    /// Reading from the socket failed; teardown follows.
    fn on_io_error(&self, link: &Arc<Link>, error: &std::io::Error) {
        let _ = (link, error);
    }
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// One TCP connection: write half, reader task, and lifecycle state.
///
/// Inbound envelopes are dispatched synchronously on the reader task, so a
/// slow handler stalls only this connection. Writes are serialized on a
/// per-link mutex so concurrent senders never interleave partial frames.
pub struct Link {
    peer_addr: SocketAddr,
    peer_id: Option<ClientId>,
    state: AtomicU8,
    closing: AtomicBool,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    registry: Arc<CommandRegistry>,
    hooks: Arc<dyn LinkHooks>,
}

impl Link {
    /// Opens a client connection, bounded by `connect_timeout`.
    ///
    /// # Errors
    ///
    /// [`ConnectError::TimedOut`] when the deadline elapses first,
    /// [`ConnectError::Refused`] when the peer actively refuses, and
    /// [`ConnectError::Unreachable`] for resolution or routing failures.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        registry: Arc<CommandRegistry>,
        hooks: Arc<dyn LinkHooks>,
    ) -> Result<Arc<Self>, ConnectError> {
        let addr = format!("{host}:{port}");
        let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(classify_connect_failure(addr, source)),
            Err(_) => {
                return Err(ConnectError::TimedOut {
                    addr,
                    timeout: connect_timeout,
                })
            }
        };
        debug!(addr = %stream.peer_addr().map(|a| a.to_string()).unwrap_or(addr), "connected");
        Ok(Self::spawn(stream, None, registry, hooks).await)
    }

    /// Wraps an already-established socket, starts its reader, and runs the
    /// connected hook to completion before inbound dispatch begins.
    ///
    /// `peer_id` is the session id the owning server allocated for this
    /// connection; client-side links pass `None`.
    pub async fn spawn(
        stream: TcpStream,
        peer_id: Option<ClientId>,
        registry: Arc<CommandRegistry>,
        hooks: Arc<dyn LinkHooks>,
    ) -> Arc<Self> {
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%error, "could not disable Nagle on the new socket");
        }
        let peer_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();

        let link = Arc::new(Self {
            peer_addr,
            peer_id,
            state: AtomicU8::new(STATE_CONNECTING),
            closing: AtomicBool::new(false),
            write_half: Mutex::new(Some(write_half)),
            reader: std::sync::Mutex::new(None),
            registry,
            hooks,
        });
        link.state.store(STATE_CONNECTED, Ordering::SeqCst);

        let (start_tx, start_rx) = oneshot::channel::<()>();
        let reader_handle = tokio::spawn({
            let link = Arc::clone(&link);
            async move {
                if start_rx.await.is_err() {
                    return;
                }
                link.read_loop(read_half).await;
            }
        });
        *link
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reader_handle);

        link.hooks.on_connected(&link).await;
        let _ = start_tx.send(());
        link
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Session id assigned by the owning server, when this is a server-side
    /// link.
    pub fn peer_id(&self) -> Option<ClientId> {
        self.peer_id
    }

    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTING => LinkState::Connecting,
            STATE_CONNECTED => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    /// Writes one envelope as a single frame.
    ///
    /// A failed write does not tear the link down here; the reader observes
    /// the broken socket on its own side and runs the one true teardown.
    ///
    /// # Errors
    ///
    /// [`LinkError::Closed`] once disconnected, [`LinkError::Codec`] when
    /// the envelope cannot be serialized, [`LinkError::Io`] when the socket
    /// write fails.
    pub async fn send(&self, envelope: &CommandEnvelope) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Closed);
        }
        let frame = codec::encode_frame(&codec::encode_envelope(envelope)?)?;

        let mut guard = self.write_half.lock().await;
        let Some(write_half) = guard.as_mut() else {
            return Err(LinkError::Closed);
        };
        write_half.write_all(&frame).await?;
        write_half.flush().await?;
        trace!(
            peer = %self.peer_addr,
            code = %envelope.code,
            bytes = frame.len(),
            "frame written"
        );
        Ok(())
    }

    /// Deliberately closes the link. Safe to call repeatedly; only the first
    /// call performs teardown. The disconnecting hook runs first, while the
    /// socket can still carry a final frame.
    pub async fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_connected() {
            self.hooks.on_disconnecting(self).await;
        }
        self.teardown(true).await;
    }

    /// Teardown entry for the reader task itself (EOF, read error, or an
    /// unrecoverable frame). Never aborts the reader: it is already on its
    /// way out, and aborting ourselves would cancel the closed hook.
    async fn fail(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown(false).await;
    }

    async fn teardown(self: &Arc<Self>, abort_reader: bool) {
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if abort_reader {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
        // Dropping the write half sends FIN; the peer's reader sees EOF.
        self.write_half.lock().await.take();
        debug!(peer = %self.peer_addr, "link closed");
        self.hooks.on_closed(self).await;
    }

    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut recv_buf: Vec<u8> = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];

        'recv: while self.is_connected() {
            let read = match read_half.read(&mut chunk).await {
                Ok(0) => {
                    debug!(peer = %self.peer_addr, "peer closed the connection");
                    break 'recv;
                }
                Ok(read) => read,
                Err(error) => {
                    if self.is_connected() {
                        warn!(peer = %self.peer_addr, %error, "read failed");
                        self.hooks.on_io_error(&self, &error);
                    }
                    break 'recv;
                }
            };
            recv_buf.extend_from_slice(&chunk[..read]);

            // Drain every complete frame accumulated so far.
            loop {
                match codec::extract_frame(&mut recv_buf) {
                    Ok(Some(text)) => match codec::decode_envelope(&text) {
                        Ok(envelope) => {
                            self.registry.dispatch(&self, envelope);
                        }
                        Err(error) => {
                            if self.is_connected() {
                                self.hooks.on_bad_frame(&self, &error);
                            }
                        }
                    },
                    Ok(None) => break,
                    Err(error @ CodecError::FrameTooLarge { .. }) => {
                        // Stream alignment is lost; nothing after this byte
                        // can be trusted.
                        if self.is_connected() {
                            self.hooks.on_bad_frame(&self, &error);
                        }
                        break 'recv;
                    }
                    Err(error) => {
                        if self.is_connected() {
                            self.hooks.on_bad_frame(&self, &error);
                        }
                    }
                }
            }
        }

        self.fail().await;
    }
}

fn classify_connect_failure(addr: String, source: std::io::Error) -> ConnectError {
    if source.kind() == std::io::ErrorKind::ConnectionRefused {
        ConnectError::Refused { addr, source }
    } else {
        ConnectError::Unreachable { addr, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_connections_are_classified() {
        let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");

        let error = classify_connect_failure("10.0.0.1:7".to_string(), source);

        assert!(matches!(error, ConnectError::Refused { .. }), "got {error:?}");
    }

    #[test]
    fn test_other_io_failures_are_unreachable() {
        let source = std::io::Error::new(std::io::ErrorKind::Other, "no route to host");

        let error = classify_connect_failure("10.0.0.1:7".to_string(), source);

        assert!(matches!(error, ConnectError::Unreachable { .. }), "got {error:?}");
    }
}
