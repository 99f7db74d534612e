//! Command registration and dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, error};

use crate::protocol::envelope::CommandEnvelope;
use crate::runtime::link::Link;

/// Handler invoked on the reader task of the link that received the command.
pub type CommandHandler = Arc<dyn Fn(&Arc<Link>, CommandEnvelope) + Send + Sync>;

/// Rejections from the application-facing registration surfaces.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("command code {code:?} is reserved for protocol use")]
    ReservedCode { code: String },
}

struct CommandRegistration {
    code: String,
    handler: CommandHandler,
}

/// Append-only code→handler table.
///
/// Duplicate codes are permitted; dispatch scans in registration order and
/// the first match wins, so later registrations under an existing code are
/// never invoked.
pub struct CommandRegistry {
    entries: RwLock<Vec<CommandRegistration>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Appends a handler for `code`.
    ///
    /// The reserved-code policy is enforced by the runtimes that own the
    /// registry, not here: the runtimes themselves register under the
    /// `sys/` prefix.
    pub fn register<F>(&self, code: impl Into<String>, handler: F)
    where
        F: Fn(&Arc<Link>, CommandEnvelope) + Send + Sync + 'static,
    {
        let code = code.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(CommandRegistration {
            code,
            handler: Arc::new(handler),
        });
    }

    /// Number of registrations, duplicates included.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Routes one envelope to the first handler registered under its code,
    /// returning whether any handler matched.
    ///
    /// Unknown codes are dropped without error so a peer may send commands
    /// this side does not understand yet. A panicking handler is caught and
    /// logged; the connection stays usable.
    pub fn dispatch(&self, link: &Arc<Link>, envelope: CommandEnvelope) -> bool {
        let handler = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .find(|entry| entry.code == envelope.code)
                .map(|entry| Arc::clone(&entry.handler))
        };
        let Some(handler) = handler else {
            debug!(code = %envelope.code, "dropping command with no registered handler");
            return false;
        };

        let code = envelope.code.clone();
        if catch_unwind(AssertUnwindSafe(|| handler(link, envelope))).is_err() {
            error!(code = %code, "command handler panicked");
        }
        true
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{Command, Payload};
    use crate::runtime::link::LinkHooks;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    struct NoopHooks;

    #[async_trait::async_trait]
    impl LinkHooks for NoopHooks {}

    /// Builds a server-side link over a loopback socket pair. The far end is
    /// returned too so the connection stays open for the test's duration.
    async fn loopback_link(registry: Arc<CommandRegistry>) -> (Arc<Link>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind must succeed");
        let addr = listener.local_addr().expect("local addr must be known");

        let (outbound, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let far_end = outbound.expect("connect must succeed");
        let (stream, _) = accepted.expect("accept must succeed");

        let link = Link::spawn(stream, None, registry, Arc::new(NoopHooks)).await;
        (link, far_end)
    }

    fn text_envelope(code: &str, text: &str) -> CommandEnvelope {
        Command::new(code, Payload::Text(text.to_string())).envelope()
    }

    #[tokio::test]
    async fn test_dispatch_invokes_matching_handler() {
        let registry = Arc::new(CommandRegistry::new());
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            registry.register("print", move |_link, envelope| {
                assert_eq!(envelope.payload, Payload::Text("Hello".to_string()));
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        let (link, _far_end) = loopback_link(Arc::clone(&registry)).await;

        let matched = registry.dispatch(&link, text_envelope("print", "Hello"));

        assert!(matched);
        assert_eq!(seen.load(Ordering::SeqCst), 1, "handler must run exactly once");
    }

    #[tokio::test]
    async fn test_unknown_code_is_dropped_silently() {
        let registry = Arc::new(CommandRegistry::new());
        let (link, _far_end) = loopback_link(Arc::clone(&registry)).await;

        let matched = registry.dispatch(&link, text_envelope("nobody-home", "x"));

        assert!(!matched, "an unregistered code must not be an error");
    }

    #[tokio::test]
    async fn test_duplicate_code_keeps_first_handler() {
        let registry = Arc::new(CommandRegistry::new());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        {
            let first = Arc::clone(&first);
            registry.register("dup", move |_link, _envelope| {
                first.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let second = Arc::clone(&second);
            registry.register("dup", move |_link, _envelope| {
                second.fetch_add(1, Ordering::SeqCst);
            });
        }
        let (link, _far_end) = loopback_link(Arc::clone(&registry)).await;

        registry.dispatch(&link, text_envelope("dup", "x"));
        registry.dispatch(&link, text_envelope("dup", "y"));

        assert_eq!(first.load(Ordering::SeqCst), 2, "first registration wins every time");
        assert_eq!(second.load(Ordering::SeqCst), 0, "later duplicate must never fire");
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let registry = Arc::new(CommandRegistry::new());
        registry.register("explode", |_link, _envelope| panic!("boom"));
        let survived = Arc::new(AtomicUsize::new(0));
        {
            let survived = Arc::clone(&survived);
            registry.register("after", move |_link, _envelope| {
                survived.fetch_add(1, Ordering::SeqCst);
            });
        }
        let (link, _far_end) = loopback_link(Arc::clone(&registry)).await;

        let matched = registry.dispatch(&link, text_envelope("explode", "x"));
        registry.dispatch(&link, text_envelope("after", "y"));

        assert!(matched, "a panicking handler still counts as matched");
        assert_eq!(survived.load(Ordering::SeqCst), 1, "dispatch must keep working");
    }
}
