//! Client OS identity for the introduce handshake.
//!
//! Immediately after connecting, a client reports who and where it is: OS
//! name, OS user, current working directory, and home directory. The server
//! keeps this alongside the assigned id so operators can tell sessions apart
//! in logs. The values travel as a JSON object inside the `sys/introduce`
//! envelope, next to a `clock_nanos` wall-clock sample.

use serde_json::{json, Map, Value};

/// Identity a client reports about its host environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// OS family, e.g. `"linux"`, `"windows"`, `"macos"`.
    pub os_name: String,
    /// Login name of the user running the client.
    pub os_user: String,
    /// Client process working directory.
    pub working_dir: String,
    /// User home directory.
    pub home_dir: String,
}

impl ClientIdentity {
    /// Captures the identity of the current process from the environment.
    ///
    /// Missing environment variables degrade to an empty string rather than
    /// failing: an incomplete identity is still worth reporting.
    pub fn capture() -> Self {
        Self {
            os_name: std::env::consts::OS.to_string(),
            os_user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_default(),
            working_dir: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            home_dir: std::env::var("HOME")
                .or_else(|_| std::env::var("USERPROFILE"))
                .unwrap_or_default(),
        }
    }

    /// The JSON object form carried inside the introduce envelope.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("os_name".to_string(), json!(self.os_name));
        map.insert("os_user".to_string(), json!(self.os_user));
        map.insert("working_dir".to_string(), json!(self.working_dir));
        map.insert("home_dir".to_string(), json!(self.home_dir));
        map
    }

    /// Reads an identity back out of a handshake object.
    ///
    /// Returns `None` when none of the identity fields are present at all —
    /// the mark of a malformed introduce payload. Individual missing fields
    /// degrade to empty strings, mirroring [`ClientIdentity::capture`].
    pub fn from_json(map: &Map<String, Value>) -> Option<Self> {
        let field = |name: &str| {
            map.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let os_name = field("os_name");
        let os_user = field("os_user");
        let working_dir = field("working_dir");
        let home_dir = field("home_dir");

        if os_name.is_none() && os_user.is_none() && working_dir.is_none() && home_dir.is_none() {
            return None;
        }

        Some(Self {
            os_name: os_name.unwrap_or_default(),
            os_user: os_user.unwrap_or_default(),
            working_dir: working_dir.unwrap_or_default(),
            home_dir: home_dir.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_reports_the_build_os() {
        let identity = ClientIdentity::capture();

        assert_eq!(identity.os_name, std::env::consts::OS);
    }

    #[test]
    fn test_json_round_trip() {
        let identity = ClientIdentity {
            os_name: "linux".to_string(),
            os_user: "dev".to_string(),
            working_dir: "/srv/app".to_string(),
            home_dir: "/home/dev".to_string(),
        };

        let restored = ClientIdentity::from_json(&identity.to_json())
            .expect("a full object must parse");

        assert_eq!(restored, identity);
    }

    #[test]
    fn test_partial_object_degrades_to_empty_fields() {
        let mut map = Map::new();
        map.insert("os_name".to_string(), json!("windows"));

        let identity = ClientIdentity::from_json(&map).expect("one field is enough");

        assert_eq!(identity.os_name, "windows");
        assert_eq!(identity.os_user, "");
        assert_eq!(identity.home_dir, "");
    }

    #[test]
    fn test_object_without_identity_fields_is_rejected() {
        let mut map = Map::new();
        map.insert("clock_nanos".to_string(), json!(12345));

        assert_eq!(ClientIdentity::from_json(&map), None);
    }
}
