//! cmdlink client — command-line entry point.
//!
//! Connects to a cmdlink server, stages the given text values, sends them
//! under one command code, reports the server-assigned id, and disconnects.
//!
//! # Usage
//!
//! ```text
//! cmdlink-client [OPTIONS] [VALUES]...
//!
//! Options:
//!   --host <HOST>               Server hostname or IP [default: 127.0.0.1]
//!   --port <PORT>               Server port [default: 24810]
//!   --code <CODE>               Command code to send [default: print]
//!   --connect-timeout-ms <MS>   Connect deadline [default: 10000]
//!   --write-timeout-ms <MS>     Notify/acknowledge deadline [default: 3000]
//!   --acknowledge               Await the write acknowledgment
//! ```
//!
//! # Environment variable overrides
//!
//! CLI arguments take precedence when both are present.
//!
//! | Variable            | Default     | Description              |
//! |---------------------|-------------|--------------------------|
//! | `CMDLINK_HOST`      | `127.0.0.1` | Server hostname or IP    |
//! | `CMDLINK_PORT`      | `24810`     | Server port              |

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cmdlink_client::{ClientConfig, CommandClient};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// cmdlink command-line client.
///
/// Stages the given values and sends them to a cmdlink server under one
/// command code.
#[derive(Debug, Parser)]
#[command(
    name = "cmdlink-client",
    about = "Send a command to a cmdlink server",
    version
)]
struct Cli {
    /// Hostname or IP address of the cmdlink server.
    #[arg(long, default_value = "127.0.0.1", env = "CMDLINK_HOST")]
    host: String,

    /// TCP port of the cmdlink server.
    #[arg(long, default_value_t = cmdlink_client::config::DEFAULT_PORT, env = "CMDLINK_PORT")]
    port: u16,

    /// Command code to send the staged values under.
    #[arg(long, default_value = "print")]
    code: String,

    /// Deadline for establishing the TCP connection, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Deadline for resolving an acknowledged send, in milliseconds.
    #[arg(long, default_value_t = 3_000)]
    write_timeout_ms: u64,

    /// Await the write acknowledgment instead of a plain send.
    #[arg(long)]
    acknowledge: bool,

    /// Text values to stage before sending.
    values: Vec<String>,
}

impl Cli {
    /// Builds a [`ClientConfig`] from the parsed arguments.
    fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            clock_report_interval: None,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let client = CommandClient::new(cli.to_client_config());

    client
        .connect()
        .await
        .with_context(|| format!("could not connect to {}:{}", cli.host, cli.port))?;

    for value in &cli.values {
        client.stage_text(value.clone());
    }

    if cli.acknowledge {
        client
            .send_acknowledge(&cli.code)
            .await
            .with_context(|| format!("acknowledged send of {:?} failed", cli.code))?;
        info!(code = %cli.code, "send acknowledged");
    } else if client.send(&cli.code).await {
        info!(code = %cli.code, "sent");
    } else {
        anyhow::bail!("send of {:?} failed", cli.code);
    }

    // The assign-id reply races our send; give the reader a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;
    match client.assigned_id() {
        Some(id) => info!(id, "server assigned id"),
        None => info!("no assigned id received yet"),
    }

    client.disconnect().await;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
