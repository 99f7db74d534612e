//! Reserved protocol command codes.
//!
//! A small set of codes is owned by the runtime itself: the introduce
//! handshake, the id assignment reply, the disconnect announcement, the
//! shutdown broadcast, and clock reports. They all live under the `sys/`
//! prefix, and the application-facing registration and send surfaces refuse
//! that prefix, so user commands can never collide with protocol traffic.

/// Code prefix owned by the protocol runtime.
pub const RESERVED_PREFIX: &str = "sys/";

/// The fixed set of protocol-level command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedCode {
    /// First frame a client sends after connecting: OS identity plus a
    /// wall-clock sample.
    Introduce,
    /// Server reply to [`ReservedCode::Introduce`] carrying the assigned id.
    AssignId,
    /// Announced by a client right before it closes its socket.
    Disconnect,
    /// Broadcast by the server to every live session before shutdown.
    Shutdown,
    /// A client wall-clock sample for drift estimation.
    ClockReport,
}

impl ReservedCode {
    /// Wire string for this code.
    pub const fn code(&self) -> &'static str {
        match self {
            ReservedCode::Introduce => "sys/introduce",
            ReservedCode::AssignId => "sys/assign-id",
            ReservedCode::Disconnect => "sys/disconnect",
            ReservedCode::Shutdown => "sys/shutdown",
            ReservedCode::ClockReport => "sys/clock",
        }
    }

    /// Inverse of [`ReservedCode::code`].
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "sys/introduce" => Some(ReservedCode::Introduce),
            "sys/assign-id" => Some(ReservedCode::AssignId),
            "sys/disconnect" => Some(ReservedCode::Disconnect),
            "sys/shutdown" => Some(ReservedCode::Shutdown),
            "sys/clock" => Some(ReservedCode::ClockReport),
            _ => None,
        }
    }

    /// True for any code applications may not register or send themselves.
    pub fn is_reserved(code: &str) -> bool {
        code.starts_with(RESERVED_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        let all = [
            ReservedCode::Introduce,
            ReservedCode::AssignId,
            ReservedCode::Disconnect,
            ReservedCode::Shutdown,
            ReservedCode::ClockReport,
        ];

        for code in all {
            assert_eq!(ReservedCode::from_code(code.code()), Some(code));
            assert!(
                ReservedCode::is_reserved(code.code()),
                "{:?} must count as reserved",
                code.code()
            );
        }
    }

    #[test]
    fn test_prefix_is_reserved_even_for_unknown_codes() {
        // Future protocol codes must already be off-limits to applications.
        assert!(ReservedCode::is_reserved("sys/anything-later"));
        assert_eq!(ReservedCode::from_code("sys/anything-later"), None);
    }

    #[test]
    fn test_application_codes_are_not_reserved() {
        assert!(!ReservedCode::is_reserved("print"));
        assert!(!ReservedCode::is_reserved("system"));
        assert!(!ReservedCode::is_reserved(""));
    }
}
