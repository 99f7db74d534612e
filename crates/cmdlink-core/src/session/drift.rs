//! Two-sample clock-drift estimation.
//!
//! When a client reports its wall clock (in the introduce handshake or a
//! later `sys/clock` report), the server computes the raw signed difference
//! `server_now - reported_client_time` and folds it into a running estimate.
//! A single sample is unreliable — network delay on either leg inflates the
//! difference — so the tracker refines across samples instead of trusting
//! the latest one:
//!
//! - no prior estimate: adopt the raw difference directly;
//! - the new sample agrees with the estimate (|delta| under 1 second): adopt
//!   their arithmetic mean;
//! - the samples disagree sharply: one of them was probably delay-inflated,
//!   so keep whichever has the smaller absolute value and discard the other.
//!
//! The result is good enough to correlate log timestamps across machines.
//! It is not a time-synchronization protocol; NTP-class accuracy is out of
//! scope.

use std::time::{SystemTime, UNIX_EPOCH};

/// Samples disagreeing by at least this much are treated as inconsistent.
const DISAGREEMENT_THRESHOLD_NANOS: i64 = 1_000_000_000;

/// Nanoseconds since the Unix epoch, as the signed integer the protocol
/// carries. A clock set before 1970 saturates to 0.
pub fn wall_clock_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// Running clock-offset estimate for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftTracker {
    estimate_nanos: Option<i64>,
}

impl DriftTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current estimate, `None` until the first sample arrives.
    pub fn estimate_nanos(&self) -> Option<i64> {
        self.estimate_nanos
    }

    /// Folds one raw `server_now - reported_client_time` sample into the
    /// estimate and returns the updated value.
    pub fn fold(&mut self, raw_diff_nanos: i64) -> i64 {
        let updated = match self.estimate_nanos {
            None => raw_diff_nanos,
            Some(previous) => {
                let delta = raw_diff_nanos.saturating_sub(previous);
                if delta.abs() < DISAGREEMENT_THRESHOLD_NANOS {
                    // Consistent measurements: progressive refinement.
                    midpoint(raw_diff_nanos, previous)
                } else if raw_diff_nanos.abs() < previous.abs() {
                    // Sharp disagreement: the smaller-magnitude sample is
                    // the less delay-inflated one.
                    raw_diff_nanos
                } else {
                    previous
                }
            }
        };
        self.estimate_nanos = Some(updated);
        updated
    }
}

/// Overflow-safe arithmetic mean of two signed samples.
fn midpoint(a: i64, b: i64) -> i64 {
    a / 2 + b / 2 + (a % 2 + b % 2) / 2
}
