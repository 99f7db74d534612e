//! Typed command envelopes and the payload model.
//!
//! One envelope is one protocol message: an opaque id minted when the
//! envelope is built, the command code that selects a handler on the peer,
//! and a single payload. The payload kind is part of the wire form, so a
//! receiver can always tell how to decode the data field before touching it.

use std::fmt;

use serde_json::{Map, Value};
use uuid::Uuid;

// ── Payload kinds ─────────────────────────────────────────────────────────────

/// Discriminant describing how an envelope's data field must be decoded.
///
/// Exactly one kind exists per [`Payload`] variant; the mapping is fixed by
/// [`Payload::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// The envelope carries no data at all.
    NoData,
    /// Plain UTF-8 text.
    StringData,
    /// A JSON object.
    JsonObjectData,
    /// A JSON array.
    JsonArrayData,
    /// Arbitrary bytes, carried as base64 text on the wire.
    BinaryData,
}

impl PayloadKind {
    /// Stable tag used for this kind on the wire.
    pub const fn tag(&self) -> &'static str {
        match self {
            PayloadKind::NoData => "none",
            PayloadKind::StringData => "string",
            PayloadKind::JsonObjectData => "json-object",
            PayloadKind::JsonArrayData => "json-array",
            PayloadKind::BinaryData => "binary",
        }
    }

    /// Inverse of [`PayloadKind::tag`]. Unknown tags yield `None` so the
    /// codec can reject them explicitly.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "none" => Some(PayloadKind::NoData),
            "string" => Some(PayloadKind::StringData),
            "json-object" => Some(PayloadKind::JsonObjectData),
            "json-array" => Some(PayloadKind::JsonArrayData),
            "binary" => Some(PayloadKind::BinaryData),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ── Payload ───────────────────────────────────────────────────────────────────

/// The data carried by one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No data.
    None,
    /// Plain text.
    Text(String),
    /// A JSON object.
    JsonObject(Map<String, Value>),
    /// A JSON array.
    JsonArray(Vec<Value>),
    /// Raw bytes.
    Binary(Vec<u8>),
}

impl Payload {
    /// The wire kind this payload travels as.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::None => PayloadKind::NoData,
            Payload::Text(_) => PayloadKind::StringData,
            Payload::JsonObject(_) => PayloadKind::JsonObjectData,
            Payload::JsonArray(_) => PayloadKind::JsonArrayData,
            Payload::Binary(_) => PayloadKind::BinaryData,
        }
    }
}

// ── Envelope and command template ─────────────────────────────────────────────

/// One protocol message unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    /// Unique per build; never reused among in-flight envelopes of one
    /// connection.
    pub id: Uuid,
    /// Selects the handler on the receiving side.
    pub code: String,
    /// The data, if any.
    pub payload: Payload,
}

impl CommandEnvelope {
    /// The wire kind of this envelope's payload.
    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }
}

/// A reusable command template.
///
/// Building an envelope from a template mints a fresh id every time, so
/// sending the same template twice never reuses an id while both messages
/// may still be in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub code: String,
    pub payload: Payload,
}

impl Command {
    pub fn new(code: impl Into<String>, payload: Payload) -> Self {
        Self {
            code: code.into(),
            payload,
        }
    }

    /// Builds a sendable envelope with a fresh id.
    pub fn envelope(&self) -> CommandEnvelope {
        CommandEnvelope {
            id: Uuid::new_v4(),
            code: self.code.clone(),
            payload: self.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip() {
        let kinds = [
            PayloadKind::NoData,
            PayloadKind::StringData,
            PayloadKind::JsonObjectData,
            PayloadKind::JsonArrayData,
            PayloadKind::BinaryData,
        ];

        for kind in kinds {
            assert_eq!(
                PayloadKind::from_tag(kind.tag()),
                Some(kind),
                "tag {:?} must map back to its kind",
                kind.tag()
            );
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert_eq!(PayloadKind::from_tag("gzip"), None);
        assert_eq!(PayloadKind::from_tag(""), None);
        assert_eq!(PayloadKind::from_tag("String"), None, "tags are case-sensitive");
    }

    #[test]
    fn test_payload_reports_its_kind() {
        assert_eq!(Payload::None.kind(), PayloadKind::NoData);
        assert_eq!(Payload::Text(String::new()).kind(), PayloadKind::StringData);
        assert_eq!(Payload::JsonObject(Map::new()).kind(), PayloadKind::JsonObjectData);
        assert_eq!(Payload::JsonArray(Vec::new()).kind(), PayloadKind::JsonArrayData);
        assert_eq!(Payload::Binary(Vec::new()).kind(), PayloadKind::BinaryData);
    }

    #[test]
    fn test_same_template_builds_distinct_ids() {
        let command = Command::new("print", Payload::Text("Hello".to_string()));

        let first = command.envelope();
        let second = command.envelope();

        assert_ne!(first.id, second.id, "each build must mint a fresh id");
        assert_eq!(first.code, second.code);
        assert_eq!(first.payload, second.payload);
        assert_eq!(first.kind(), second.kind());
    }
}
