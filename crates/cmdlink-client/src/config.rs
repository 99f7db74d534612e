//! Client configuration.

use std::time::Duration;

/// Settings for one [`CommandClient`](crate::client::CommandClient).
///
/// | Field                   | Default       | Bounds                          |
/// |-------------------------|---------------|---------------------------------|
/// | `host`                  | `127.0.0.1`   | target server host              |
/// | `port`                  | `24810`       | target server port              |
/// | `connect_timeout`       | 10 s          | socket establishment only       |
/// | `write_timeout`         | 3 s           | notify/acknowledge resolution   |
/// | `clock_report_interval` | off           | periodic `sys/clock` reports    |
///
/// `connect_timeout` bounds only how long `connect()` may take to establish
/// the TCP connection. `write_timeout` bounds only the resolution window of
/// notify/acknowledge sends — not the raw socket write, and never the peer's
/// processing of the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Hostname or IP address of the server.
    pub host: String,
    /// TCP port of the server.
    pub port: u16,
    /// Deadline for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Deadline for resolving a notify/acknowledge send.
    pub write_timeout: Duration,
    /// When set, a background task sends `sys/clock` reports at this
    /// interval while connected. Off by default so drift folding stays
    /// under the application's control.
    pub clock_report_interval: Option<Duration>,
}

/// Default server port shared with the server daemon's configuration.
pub const DEFAULT_PORT: u16 = 24810;

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(3),
            clock_report_interval: None,
        }
    }
}
