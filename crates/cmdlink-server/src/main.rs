//! The cmdlink server daemon.
//!
//! Loads the TOML config, registers a couple of built-in application
//! commands, listens until Ctrl-C, then performs a graceful shutdown that
//! notifies every connected client before closing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cmdlink_core::Payload;
use cmdlink_server::config::load_config;
use cmdlink_server::CommandServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config().context("failed to load configuration")?;
    info!(port = config.network.port, "starting cmdlink server");

    let server = Arc::new(CommandServer::new());
    register_builtin_commands(&server)?;

    server
        .start(config.network.port)
        .await
        .context("failed to start server")?;

    wait_for_shutdown_signal().await;

    info!("shutting down");
    server.stop().await;
    Ok(())
}

/// Demo commands so a freshly built daemon has something to talk to.
fn register_builtin_commands(server: &Arc<CommandServer>) -> anyhow::Result<()> {
    // print: log whatever the client sent.
    server
        .register("print", |link, envelope| {
            info!(
                id = ?link.peer_id(),
                payload = %describe_payload(&envelope.payload),
                "print"
            );
        })
        .context("registering print")?;

    // echo: send the payload straight back on the same connection.
    server
        .register("echo", |link, envelope| {
            let link = Arc::clone(link);
            tokio::spawn(async move {
                let reply = cmdlink_core::Command::new("echo", envelope.payload).envelope();
                if let Err(error) = link.send(&reply).await {
                    warn!(%error, "echo reply could not be sent");
                }
            });
        })
        .context("registering echo")?;

    Ok(())
}

fn describe_payload(payload: &Payload) -> String {
    match payload {
        Payload::None => "(none)".to_string(),
        Payload::Text(text) => text.clone(),
        Payload::JsonObject(map) => serde_json::Value::Object(map.clone()).to_string(),
        Payload::JsonArray(items) => serde_json::Value::Array(items.clone()).to_string(),
        Payload::Binary(bytes) => format!("({} bytes)", bytes.len()),
    }
}

/// Blocks until Ctrl-C. A failure to install the handler is treated as an
/// immediate shutdown request rather than a reason to run unstoppable.
async fn wait_for_shutdown_signal() {
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(%error, "could not listen for Ctrl-C");
            }
            interrupted.store(true, Ordering::SeqCst);
        });
    }
    while !interrupted.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
