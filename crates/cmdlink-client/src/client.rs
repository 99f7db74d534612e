//! The client runtime.
//!
//! A [`CommandClient`] wraps one [`Link`] with the client side of the
//! protocol: the introduce handshake after connect, default handlers for the
//! server's reserved traffic, an outgoing staging buffer, and the three send
//! variants.
//!
//! # Send variants (for beginners)
//!
//! - [`CommandClient::send`] — drain the staging buffer, write one frame,
//!   report whether the local write succeeded. Nothing waits for the peer.
//! - [`CommandClient::send_notify`] — fire-and-forget: the outcome of the
//!   local write is delivered later through caller-supplied callbacks,
//!   bounded by `write_timeout`. The caller is never blocked.
//! - [`CommandClient::send_acknowledge`] — the awaitable sibling of notify:
//!   same resolution rules, returned as a `Result` instead of callbacks.
//!
//! In every variant "success" means the frame was flushed to the socket. It
//! never means the server has processed the command: a server handler may
//! still be running long after a notify send resolved successfully.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cmdlink_core::protocol::codes::ReservedCode;
use cmdlink_core::runtime::link::{ConnectError, Link, LinkError, LinkHooks};
use cmdlink_core::runtime::registry::{CommandRegistry, RegistryError};
use cmdlink_core::runtime::staging::{StagedValue, StagingBuffer};
use cmdlink_core::session::drift::wall_clock_nanos;
use cmdlink_core::session::identity::ClientIdentity;
use cmdlink_core::session::ids::ClientId;
use cmdlink_core::{Command, CommandEnvelope, Payload};

use crate::config::ClientConfig;

/// Failures surfaced from the send surfaces.
#[derive(Debug, Error)]
pub enum SendError {
    /// The code belongs to the protocol runtime, not to applications.
    #[error("command code {code:?} is reserved for protocol use")]
    ReservedCode { code: String },

    /// No live connection exists.
    #[error("client is not connected")]
    NotConnected,

    /// The local write did not resolve within the configured window.
    #[error("send did not resolve within {timeout:?}")]
    TimedOut { timeout: Duration },

    /// The write itself failed.
    #[error(transparent)]
    Link(#[from] LinkError),
}

type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// State shared between the client, its lifecycle hooks, and its default
/// command handlers.
struct ClientShared {
    link: Mutex<Option<Arc<Link>>>,
    assigned_id: Mutex<Option<ClientId>>,
    /// Deadline per unresolved notify/acknowledge send, keyed by envelope
    /// id. Entries are removed the moment their send resolves.
    pending: Mutex<HashMap<Uuid, Instant>>,
    on_server_shutdown: Mutex<Option<EventCallback>>,
    on_disconnect: Mutex<Option<EventCallback>>,
}

impl ClientShared {
    fn current_link(&self) -> Option<Arc<Link>> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ── Lifecycle hooks ───────────────────────────────────────────────────────────

struct ClientHooks {
    shared: Arc<ClientShared>,
}

#[async_trait]
impl LinkHooks for ClientHooks {
    /// Runs before any inbound dispatch: the introduce frame is guaranteed
    /// to be the first thing the server sees from this connection.
    async fn on_connected(&self, link: &Arc<Link>) {
        let mut object = ClientIdentity::capture().to_json();
        object.insert("clock_nanos".to_string(), json!(wall_clock_nanos()));
        let envelope =
            Command::new(ReservedCode::Introduce.code(), Payload::JsonObject(object)).envelope();

        if let Err(error) = link.send(&envelope).await {
            warn!(%error, "introduce handshake could not be sent");
        }
    }

    /// Announces the disconnect so the server can drop the session without
    /// waiting for EOF.
    async fn on_disconnecting(&self, link: &Arc<Link>) {
        let envelope = Command::new(ReservedCode::Disconnect.code(), Payload::None).envelope();
        if let Err(error) = link.send(&envelope).await {
            debug!(%error, "disconnect announcement could not be sent");
        }
    }

    async fn on_closed(&self, _link: &Arc<Link>) {
        self.shared
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let callback = self
            .shared
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// One client endpoint of the command protocol.
pub struct CommandClient {
    config: ClientConfig,
    registry: Arc<CommandRegistry>,
    staging: StagingBuffer,
    shared: Arc<ClientShared>,
}

impl CommandClient {
    pub fn new(config: ClientConfig) -> Self {
        let shared = Arc::new(ClientShared {
            link: Mutex::new(None),
            assigned_id: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            on_server_shutdown: Mutex::new(None),
            on_disconnect: Mutex::new(None),
        });
        let registry = Arc::new(CommandRegistry::new());
        install_reserved_handlers(&registry, &shared);

        Self {
            config,
            registry,
            staging: StagingBuffer::new(),
            shared,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Connects to the configured server, bounded by `connect_timeout`.
    ///
    /// The introduce handshake has been written by the time this returns, so
    /// the first user command can never overtake it. Connecting while
    /// already connected is a no-op.
    ///
    /// # Errors
    ///
    /// [`ConnectError::TimedOut`] when the deadline elapses,
    /// [`ConnectError::Refused`] when the peer refuses, and
    /// [`ConnectError::Unreachable`] for everything else.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.is_connected() {
            debug!("connect called while already connected; ignoring");
            return Ok(());
        }
        *self
            .shared
            .assigned_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        let link = Link::connect(
            &self.config.host,
            self.config.port,
            self.config.connect_timeout,
            Arc::clone(&self.registry),
            Arc::new(ClientHooks {
                shared: Arc::clone(&self.shared),
            }),
        )
        .await?;

        *self
            .shared
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&link));
        info!(host = %self.config.host, port = self.config.port, "connected");

        if let Some(interval) = self.config.clock_report_interval {
            spawn_clock_reporter(link, interval);
        }
        Ok(())
    }

    /// Closes the connection. Safe to call repeatedly and while already
    /// disconnected. The server is told first via `sys/disconnect`.
    pub async fn disconnect(&self) {
        if let Some(link) = self.shared.current_link() {
            link.close().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .current_link()
            .is_some_and(|link| link.is_connected())
    }

    /// The id the server assigned to this client, once the handshake reply
    /// has been processed.
    pub fn assigned_id(&self) -> Option<ClientId> {
        *self
            .shared
            .assigned_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── Callbacks and registration ────────────────────────────────────────────

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

    /// Observes the server's shutdown broadcast; runs before the local
    /// disconnect it triggers.
    pub fn on_server_shutdown(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self
            .shared
            .on_server_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Observes any teardown of the connection, local or remote, once per
    /// connection.
    pub fn on_disconnect(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self
            .shared
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
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

    /// Drains the staging buffer into one envelope and writes it, reporting
    /// whether the local write succeeded. The buffer is cleared regardless
    /// of the outcome.
    pub async fn send(&self, code: &str) -> bool {
        let envelope = match self.prepare(code) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "send rejected");
                return false;
            }
        };
        let Some(link) = self.shared.current_link() else {
            debug!(code, "send skipped: not connected");
            return false;
        };
        match link.send(&envelope).await {
            Ok(()) => true,
            Err(error) => {
                warn!(code, %error, "send failed");
                false
            }
        }
    }

    /// Fire-and-forget send with an asynchronous acknowledgment.
    ///
    /// Returns immediately. A background task resolves the local write
    /// within `write_timeout`: `on_success` receives the code once the frame
    /// is flushed, `on_failure` receives the error when the write fails or
    /// the deadline elapses first. Exactly one of the two runs. Resolution
    /// reflects only the local write; it says nothing about the server's
    /// processing of the command.
    ///
    /// Must be called from within a tokio runtime.
    pub fn send_notify<S, F>(&self, code: &str, on_success: S, on_failure: F)
    where
        S: FnOnce(String) + Send + 'static,
        F: FnOnce(SendError) + Send + 'static,
    {
        let envelope = match self.prepare(code) {
            Ok(envelope) => envelope,
            Err(error) => {
                // Resolves without ever entering the pending table.
                on_failure(error);
                return;
            }
        };

        let id = envelope.id;
        let write_timeout = self.config.write_timeout;
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Instant::now() + write_timeout);

        let shared = Arc::clone(&self.shared);
        let link = self.shared.current_link();
        let code = code.to_string();
        tokio::spawn(async move {
            let result = resolve_write(link, &envelope, write_timeout).await;
            shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            match result {
                Ok(()) => on_success(code),
                Err(error) => on_failure(error),
            }
        });
    }

    /// The awaitable sibling of [`CommandClient::send_notify`]: blocks the
    /// caller until the local write resolves or `write_timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`SendError::ReservedCode`], [`SendError::NotConnected`],
    /// [`SendError::TimedOut`], or the underlying [`SendError::Link`] write
    /// failure.
    pub async fn send_acknowledge(&self, code: &str) -> Result<(), SendError> {
        let envelope = self.prepare(code)?;
        let id = envelope.id;
        let write_timeout = self.config.write_timeout;
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Instant::now() + write_timeout);

        let result = resolve_write(self.shared.current_link(), &envelope, write_timeout).await;
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        result
    }

    /// Number of notify/acknowledge sends not yet resolved.
    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sends one `sys/clock` wall-clock report for drift estimation.
    ///
    /// # Errors
    ///
    /// [`SendError::NotConnected`] without a live connection, or the
    /// underlying write failure.
    pub async fn report_clock(&self) -> Result<(), SendError> {
        let link = self.shared.current_link().ok_or(SendError::NotConnected)?;
        send_clock_report(&link).await.map_err(SendError::from)
    }

    /// Drains the staging buffer into an envelope for `code`, enforcing the
    /// reserved-code guard. The buffer is cleared even when the code is
    /// rejected, so stale fragments never leak into a later send.
    fn prepare(&self, code: &str) -> Result<CommandEnvelope, SendError> {
        let payload = self.staging.drain();
        if ReservedCode::is_reserved(code) {
            return Err(SendError::ReservedCode {
                code: code.to_string(),
            });
        }
        Ok(Command::new(code, payload).envelope())
    }
}

// ── Reserved-traffic handlers ─────────────────────────────────────────────────

fn install_reserved_handlers(registry: &Arc<CommandRegistry>, shared: &Arc<ClientShared>) {
    // sys/assign-id: the server's reply to the introduce handshake.
    {
        let shared = Arc::clone(shared);
        registry.register(ReservedCode::AssignId.code(), move |_link, envelope| {
            let Payload::JsonObject(map) = &envelope.payload else {
                warn!("assign-id payload is not an object; ignoring");
                return;
            };
            let Some(id) = map.get("id").and_then(Value::as_u64) else {
                warn!("assign-id payload carries no id; ignoring");
                return;
            };
            debug!(id, "received assigned id");
            *shared
                .assigned_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(id as ClientId);
        });
    }

    // sys/shutdown: the server is going down; run the user callback, then
    // close our side. The close is spawned because handlers run
    // synchronously on the reader task.
    {
        let shared = Arc::clone(shared);
        registry.register(ReservedCode::Shutdown.code(), move |link, _envelope| {
            info!("server announced shutdown");
            let callback = shared
                .on_server_shutdown
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                callback();
            }
            let link = Arc::clone(link);
            tokio::spawn(async move {
                link.close().await;
            });
        });
    }
}

// ── Write resolution and clock reports ────────────────────────────────────────

/// Resolves one staged write within `write_timeout`.
///
/// The timeout bounds only how long the local write may take to complete; a
/// write that flushes in time resolves successfully no matter what the peer
/// does with the frame afterwards.
async fn resolve_write(
    link: Option<Arc<Link>>,
    envelope: &CommandEnvelope,
    write_timeout: Duration,
) -> Result<(), SendError> {
    let Some(link) = link else {
        return Err(SendError::NotConnected);
    };
    match timeout(write_timeout, link.send(envelope)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(SendError::Link(error)),
        Err(_) => Err(SendError::TimedOut {
            timeout: write_timeout,
        }),
    }
}

async fn send_clock_report(link: &Arc<Link>) -> Result<(), LinkError> {
    let mut object = serde_json::Map::new();
    object.insert("clock_nanos".to_string(), json!(wall_clock_nanos()));
    let envelope =
        Command::new(ReservedCode::ClockReport.code(), Payload::JsonObject(object)).envelope();
    link.send(&envelope).await
}

fn spawn_clock_reporter(link: Arc<Link>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if !link.is_connected() {
                break;
            }
            if let Err(error) = send_clock_report(&link).await {
                debug!(%error, "periodic clock report failed; stopping");
                break;
            }
        }
    });
}
