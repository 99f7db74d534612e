//! Server-side bookkeeping for one connected client.

use std::sync::Arc;
use std::time::SystemTime;

use cmdlink_core::runtime::link::Link;
use cmdlink_core::session::drift::{wall_clock_nanos, DriftTracker};
use cmdlink_core::session::identity::ClientIdentity;
use cmdlink_core::session::ids::ClientId;

/// One live client session.
///
/// Created when a connection's introduce handshake is processed; removed
/// from the session table when its link closes. A session therefore always
/// holds a link that was connected at creation time — a dead link and a
/// present session never coexist for longer than the closed hook takes to
/// run.
pub struct ClientSession {
    /// Server-assigned id, unique for the process lifetime.
    pub id: ClientId,
    /// The connection this session rides on.
    pub link: Arc<Link>,
    /// Identity the client reported in its handshake.
    pub identity: ClientIdentity,
    /// Running clock-offset estimate for this client.
    pub drift: DriftTracker,
    /// When the handshake completed.
    pub connected_at: SystemTime,
}

impl ClientSession {
    /// Creates a session from a completed handshake, folding the handshake's
    /// wall-clock sample as the first drift measurement when present.
    pub fn new(
        id: ClientId,
        link: Arc<Link>,
        identity: ClientIdentity,
        clock_nanos: Option<i64>,
    ) -> Self {
        let mut drift = DriftTracker::new();
        if let Some(reported) = clock_nanos {
            drift.fold(wall_clock_nanos().saturating_sub(reported));
        }
        Self {
            id,
            link,
            identity,
            drift,
            connected_at: SystemTime::now(),
        }
    }

    /// Folds one reported client wall-clock sample into the drift estimate
    /// and returns the updated offset.
    pub fn fold_clock_report(&mut self, reported_client_nanos: i64) -> i64 {
        self.drift
            .fold(wall_clock_nanos().saturating_sub(reported_client_nanos))
    }

    /// Current clock-offset estimate, `None` before the first sample.
    pub fn clock_offset_nanos(&self) -> Option<i64> {
        self.drift.estimate_nanos()
    }
}
