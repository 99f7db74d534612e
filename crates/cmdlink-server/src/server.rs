//! The server runtime: accept loop, session table, and fan-out sends.
//!
//! # Connection lifecycle (for beginners)
//!
//! ```text
//! accepted ──► pending ──► session ──► closed
//!                (id         (introduce
//!                 assigned)   processed)
//! ```
//!
//! An accepted socket immediately gets a reader task and an assigned id, but
//! it is only *pending* until its `sys/introduce` frame arrives: the server
//! does not consider the client established — and will not unicast to it —
//! before then. Processing the introduce promotes the link to a
//! [`ClientSession`], records the reported identity, folds the handshake's
//! clock sample, and replies with `sys/assign-id`. Pending links that never
//! introduce themselves are still torn down by `disconnect_all` and `stop`.
//!
//! The session table is a `RwLock<HashMap>` with short critical sections;
//! fan-out snapshots the links under the read lock and performs every write
//! outside it, so accepts and disconnects never stall behind a slow send.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use cmdlink_core::protocol::codec::CodecError;
use cmdlink_core::protocol::codes::ReservedCode;
use cmdlink_core::runtime::link::{Link, LinkHooks};
use cmdlink_core::runtime::registry::{CommandRegistry, RegistryError};
use cmdlink_core::runtime::staging::{StagedValue, StagingBuffer};
use cmdlink_core::session::identity::ClientIdentity;
use cmdlink_core::session::ids::{ClientId, IdAllocator};
use cmdlink_core::{Command, CommandEnvelope, Payload};

use crate::session::ClientSession;

/// How often the accept loop wakes to check the running flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Failures surfaced from [`CommandServer::start`].
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called on a server that is already running.
    #[error("server is already running")]
    AlreadyRunning,

    /// The listening socket could not be bound.
    #[error("failed to bind port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// State shared between the server, its accept loop, its per-link hooks,
/// and its reserved-command handlers.
struct ServerShared {
    running: AtomicBool,
    stopping: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    ids: IdAllocator,
    /// Established sessions, keyed by assigned id.
    sessions: RwLock<HashMap<ClientId, ClientSession>>,
    /// Accepted links that have not introduced themselves yet.
    pending: Mutex<HashMap<ClientId, Arc<Link>>>,
}

// ── Per-link hooks ────────────────────────────────────────────────────────────

struct ServerHooks {
    shared: Arc<ServerShared>,
}

#[async_trait]
impl LinkHooks for ServerHooks {
    /// Runs before the link's first inbound dispatch, so the pending entry
    /// exists by the time the introduce frame can arrive.
    async fn on_connected(&self, link: &Arc<Link>) {
        let Some(id) = link.peer_id() else {
            return;
        };
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(link));
    }

    async fn on_closed(&self, link: &Arc<Link>) {
        let Some(id) = link.peer_id() else {
            return;
        };
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let removed = self
            .shared
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            info!(id, "session closed");
        } else {
            debug!(id, "pending connection closed before introducing itself");
        }
    }

    fn on_bad_frame(&self, link: &Arc<Link>, error: &CodecError) {
        warn!(id = ?link.peer_id(), %error, "undecodable frame from client");
    }

    fn on_io_error(&self, link: &Arc<Link>, error: &std::io::Error) {
        warn!(id = ?link.peer_id(), %error, "read failure on client connection");
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// One server endpoint of the command protocol.
pub struct CommandServer {
    registry: Arc<CommandRegistry>,
    staging: StagingBuffer,
    shared: Arc<ServerShared>,
}

impl CommandServer {
    pub fn new() -> Self {
        let shared = Arc::new(ServerShared {
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            ids: IdAllocator::new(),
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        });
        let registry = Arc::new(CommandRegistry::new());
        install_reserved_handlers(&registry, &shared);

        Self {
            registry,
            staging: StagingBuffer::new(),
            shared,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Binds `0.0.0.0:port` and spawns the accept loop. Port 0 asks the OS
    /// for a free port; [`CommandServer::local_addr`] reports the result.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] when already started,
    /// [`ServerError::Bind`] when the socket cannot be bound.
    pub async fn start(&self, port: u16) -> Result<(), ServerError> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServerError::AlreadyRunning);
        }
        self.shared.stopping.store(false, Ordering::SeqCst);

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(source) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(ServerError::Bind { port, source });
            }
        };
        let addr = listener.local_addr().ok();
        *self
            .shared
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = addr;
        info!(addr = ?addr, "server listening");

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            Arc::clone(&self.registry),
        ));
        Ok(())
    }

    /// Stops accepting, broadcasts `sys/shutdown` to every live session,
    /// then closes every connection. Idempotent.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        let shutdown = Command::new(ReservedCode::Shutdown.code(), Payload::None);
        for (id, link) in self.session_links() {
            if let Err(error) = link.send(&shutdown.envelope()).await {
                debug!(id, %error, "shutdown notice could not be delivered");
            }
        }
        self.close_all_links().await;
        info!("server stopped");
    }

    /// Stops accepting new connections but leaves every existing connection
    /// alive. Idempotent.
    pub fn stop_keeping_clients(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!("server stopped accepting; existing clients kept");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The bound listening address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .shared
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Registers a handler for an application command code.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ReservedCode`] for codes under the `sys/` prefix.
    pub fn register<F>(&self, code: impl Into<String>, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&Arc<Link>, CommandEnvelope) + Send + Sync + 'static,
    {
        let code = code.into();
        if ReservedCode::is_reserved(&code) {
            return Err(RegistryError::ReservedCode { code });
        }
        self.registry.register(code, handler);
        Ok(())
    }

    // ── Staging ───────────────────────────────────────────────────────────────

    pub fn stage_text(&self, text: impl Into<String>) {
        self.staging.stage(StagedValue::Text(text.into()));
    }

    pub fn stage_json(&self, value: Value) {
        self.staging.stage(StagedValue::Json(value));
    }

    pub fn stage_bytes(&self, bytes: Vec<u8>) {
        self.staging.stage(StagedValue::Binary(bytes));
    }

    /// Number of values staged for the next send.
    pub fn staged_count(&self) -> usize {
        self.staging.len()
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Drains the staging buffer into one envelope and sends it to the
    /// session with `id`. A nonexistent id is a `false` return, never a
    /// panic; the buffer is cleared regardless.
    pub async fn send_to_client(&self, code: &str, id: ClientId) -> bool {
        let payload = self.staging.drain();
        if ReservedCode::is_reserved(code) {
            warn!(code, "refusing to send a reserved code");
            return false;
        }
        let link = {
            let sessions = self
                .shared
                .sessions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            sessions.get(&id).map(|session| Arc::clone(&session.link))
        };
        let Some(link) = link else {
            debug!(id, code, "send skipped: no such session");
            return false;
        };
        match link.send(&Command::new(code, payload).envelope()).await {
            Ok(()) => true,
            Err(error) => {
                warn!(id, code, %error, "unicast send failed");
                false
            }
        }
    }

    /// Drains the staging buffer and sends the resulting command to every
    /// live session, returning how many were reached.
    pub async fn send_to_all(&self, code: &str) -> usize {
        let payload = self.staging.drain();
        if ReservedCode::is_reserved(code) {
            warn!(code, "refusing to broadcast a reserved code");
            return 0;
        }
        let command = Command::new(code, payload);

        let mut reached = 0;
        for (id, link) in self.session_links() {
            // Each session gets its own envelope, so ids stay unique among
            // that connection's in-flight messages.
            match link.send(&command.envelope()).await {
                Ok(()) => reached += 1,
                Err(error) => debug!(id, %error, "broadcast send skipped a dead session"),
            }
        }
        reached
    }

    // ── Forced disconnection ──────────────────────────────────────────────────

    /// Force-closes one session (or a still-pending connection) by id.
    /// Returns whether the id named a live connection.
    pub async fn disconnect_client(&self, id: ClientId) -> bool {
        let link = {
            let sessions = self
                .shared
                .sessions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            sessions.get(&id).map(|session| Arc::clone(&session.link))
        }
        .or_else(|| {
            self.shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&id)
                .cloned()
        });

        match link {
            Some(link) => {
                link.close().await;
                true
            }
            None => false,
        }
    }

    /// Force-closes every connection, established or pending.
    pub async fn disconnect_all(&self) {
        self.close_all_links().await;
    }

    // ── Bookkeeping accessors ─────────────────────────────────────────────────

    /// Number of established sessions (pending connections excluded).
    pub fn session_count(&self) -> usize {
        self.shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Ids of every established session, ascending.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// The identity the client with `id` reported in its handshake.
    pub fn client_identity(&self, id: ClientId) -> Option<ClientIdentity> {
        self.shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|session| session.identity.clone())
    }

    /// When the client with `id` completed its handshake.
    pub fn client_connected_at(&self, id: ClientId) -> Option<std::time::SystemTime> {
        self.shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|session| session.connected_at)
    }

    /// The current clock-offset estimate for the client with `id`, `None`
    /// for an unknown id or before the first sample.
    pub fn clock_offset_nanos(&self, id: ClientId) -> Option<i64> {
        self.shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .and_then(ClientSession::clock_offset_nanos)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Snapshot of every established session's link, taken under the read
    /// lock so sends never hold it.
    fn session_links(&self) -> Vec<(ClientId, Arc<Link>)> {
        self.shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, session)| (*id, Arc::clone(&session.link)))
            .collect()
    }

    async fn close_all_links(&self) {
        let mut links: Vec<Arc<Link>> =
            self.session_links().into_iter().map(|(_, link)| link).collect();
        links.extend(
            self.shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned(),
        );
        for link in links {
            link.close().await;
        }
    }
}

impl Default for CommandServer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

/// Accepts connections until the running flag clears, polling the flag every
/// [`ACCEPT_POLL_INTERVAL`] so shutdown never waits on a quiet listener.
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    registry: Arc<CommandRegistry>,
) {
    while shared.running.load(Ordering::SeqCst) {
        match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let id = shared.ids.next();
                info!(id, %peer, "accepted connection");
                let hooks = Arc::new(ServerHooks {
                    shared: Arc::clone(&shared),
                });
                // The hooks record the link in the pending table before its
                // first dispatch; the returned handle need not be kept.
                Link::spawn(stream, Some(id), Arc::clone(&registry), hooks).await;
            }
            Ok(Err(error)) => {
                // Transient accept failure; keep the server alive.
                error!(%error, "accept failed");
            }
            Err(_) => {
                // No connection this interval; re-check the running flag.
            }
        }
    }
    debug!("accept loop exited");
}

// ── Reserved-traffic handlers ─────────────────────────────────────────────────

fn install_reserved_handlers(registry: &Arc<CommandRegistry>, shared: &Arc<ServerShared>) {
    // sys/introduce: promote the pending link to a session and reply with
    // the assigned id. A malformed payload closes the connection: a peer
    // that cannot even introduce itself is not speaking this protocol.
    {
        let shared = Arc::clone(shared);
        registry.register(ReservedCode::Introduce.code(), move |link, envelope| {
            let Some(id) = link.peer_id() else {
                warn!("introduce received on a link without an assigned id");
                return;
            };
            let Some((identity, clock_nanos)) = parse_introduce(&envelope.payload) else {
                warn!(id, "malformed introduce payload; closing connection");
                let link = Arc::clone(link);
                tokio::spawn(async move {
                    link.close().await;
                });
                return;
            };

            info!(
                id,
                os = %identity.os_name,
                user = %identity.os_user,
                "client introduced"
            );
            shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            let session = ClientSession::new(id, Arc::clone(link), identity, clock_nanos);
            shared
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, session);

            // Reply from a task: handlers run synchronously on the reader.
            let link = Arc::clone(link);
            tokio::spawn(async move {
                let mut object = Map::new();
                object.insert("id".to_string(), json!(id));
                let reply =
                    Command::new(ReservedCode::AssignId.code(), Payload::JsonObject(object))
                        .envelope();
                if let Err(error) = link.send(&reply).await {
                    warn!(id, %error, "assign-id reply could not be sent");
                }
            });
        });
    }

    // sys/disconnect: the client announced its departure; close our side
    // without waiting for EOF.
    registry.register(ReservedCode::Disconnect.code(), move |link, _envelope| {
        debug!(id = ?link.peer_id(), "client announced disconnect");
        let link = Arc::clone(link);
        tokio::spawn(async move {
            link.close().await;
        });
    });

    // sys/clock: fold the reported wall-clock sample into the session's
    // drift estimate.
    {
        let shared = Arc::clone(shared);
        registry.register(ReservedCode::ClockReport.code(), move |link, envelope| {
            let Some(id) = link.peer_id() else {
                return;
            };
            let Payload::JsonObject(map) = &envelope.payload else {
                warn!(id, "clock report payload is not an object; ignoring");
                return;
            };
            let Some(reported) = map.get("clock_nanos").and_then(Value::as_i64) else {
                warn!(id, "clock report carries no sample; ignoring");
                return;
            };

            let mut sessions = shared
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(session) = sessions.get_mut(&id) {
                let offset = session.fold_clock_report(reported);
                debug!(id, offset_nanos = offset, "clock report folded");
            }
        });
    }
}

fn parse_introduce(payload: &Payload) -> Option<(ClientIdentity, Option<i64>)> {
    let Payload::JsonObject(map) = payload else {
        return None;
    };
    let identity = ClientIdentity::from_json(map)?;
    let clock_nanos = map.get("clock_nanos").and_then(Value::as_i64);
    Some((identity, clock_nanos))
}
