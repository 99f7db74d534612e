//! Envelope wire codec and frame handling.
//!
//! One frame carries one envelope as a single UTF-8 string of four fields
//! joined by the ASCII unit separator (U+001F):
//!
//! ```text
//! <id> ␟ <code> ␟ <kind-tag> ␟ <data>
//! ```
//!
//! The data field comes last and is recovered with `splitn`, so payload text
//! may itself contain the separator; only the command code is checked for it
//! at encode time. On the socket each string travels behind a 4-byte
//! big-endian length prefix.
//!
//! Decoding is strict: the declared kind must match the shape of the data
//! field, and any mismatch surfaces as a [`CodecError`] instead of being
//! coerced.

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::binary;
use crate::protocol::envelope::{CommandEnvelope, Payload, PayloadKind};

/// Field separator inside the envelope string.
const FIELD_SEPARATOR: char = '\u{1F}';

/// Upper bound on the byte length of one frame's string.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Size of the frame length prefix on the socket.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Errors produced while encoding or decoding envelopes and frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame's declared or actual length exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {declared} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { declared: usize, max: usize },

    /// The frame body is not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Fewer than four separator-delimited fields were present.
    #[error("envelope has fewer than four fields")]
    TruncatedEnvelope,

    /// The id field did not parse.
    #[error("envelope id {value:?} is not a valid id")]
    InvalidId { value: String },

    /// The kind tag is not one of the five known tags.
    #[error("unknown payload kind tag {tag:?}")]
    UnknownKind { tag: String },

    /// The command code contains the field separator.
    #[error("command code {code:?} contains the field separator")]
    InvalidCode { code: String },

    /// The data field was declared as JSON but did not parse.
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The data field parsed but does not have the declared shape.
    #[error("payload does not match its declared kind {kind}: {detail}")]
    KindMismatch { kind: PayloadKind, detail: String },

    /// The data field was declared binary but is not valid base64.
    #[error("binary payload is not valid base64: {0}")]
    InvalidBinary(#[from] base64::DecodeError),
}

// ── Envelope encoding ─────────────────────────────────────────────────────────

/// Serializes an envelope to its wire string.
///
/// # Errors
///
/// Fails when the command code contains the field separator, or when a JSON
/// payload cannot be serialized.
pub fn encode_envelope(envelope: &CommandEnvelope) -> Result<String, CodecError> {
    if envelope.code.contains(FIELD_SEPARATOR) {
        return Err(CodecError::InvalidCode {
            code: envelope.code.clone(),
        });
    }

    let data = match &envelope.payload {
        Payload::None => String::new(),
        Payload::Text(text) => text.clone(),
        Payload::JsonObject(map) => serde_json::to_string(map)?,
        Payload::JsonArray(values) => serde_json::to_string(values)?,
        Payload::Binary(bytes) => binary::encode(bytes),
    };

    let mut out = String::with_capacity(48 + envelope.code.len() + data.len());
    out.push_str(&envelope.id.to_string());
    out.push(FIELD_SEPARATOR);
    out.push_str(&envelope.code);
    out.push(FIELD_SEPARATOR);
    out.push_str(envelope.kind().tag());
    out.push(FIELD_SEPARATOR);
    out.push_str(&data);
    Ok(out)
}

// ── Envelope decoding ─────────────────────────────────────────────────────────

/// Parses one wire string back into an envelope.
///
/// # Errors
///
/// Fails on a truncated field list, an unparsable id, an unknown kind tag,
/// or a data field whose shape does not match the declared kind.
pub fn decode_envelope(text: &str) -> Result<CommandEnvelope, CodecError> {
    let mut fields = text.splitn(4, FIELD_SEPARATOR);
    let (Some(id), Some(code), Some(tag), Some(data)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(CodecError::TruncatedEnvelope);
    };

    let id = Uuid::parse_str(id).map_err(|_| CodecError::InvalidId {
        value: id.to_string(),
    })?;
    let kind = PayloadKind::from_tag(tag).ok_or_else(|| CodecError::UnknownKind {
        tag: tag.to_string(),
    })?;
    let payload = decode_data(kind, data)?;

    Ok(CommandEnvelope {
        id,
        code: code.to_string(),
        payload,
    })
}

fn decode_data(kind: PayloadKind, data: &str) -> Result<Payload, CodecError> {
    match kind {
        PayloadKind::NoData => {
            if data.is_empty() {
                Ok(Payload::None)
            } else {
                Err(CodecError::KindMismatch {
                    kind,
                    detail: format!("expected empty data, found {} bytes", data.len()),
                })
            }
        }
        PayloadKind::StringData => Ok(Payload::Text(data.to_string())),
        PayloadKind::JsonObjectData => match serde_json::from_str::<Value>(data)? {
            Value::Object(map) => Ok(Payload::JsonObject(map)),
            other => Err(CodecError::KindMismatch {
                kind,
                detail: format!("expected a JSON object, found {}", json_type_name(&other)),
            }),
        },
        PayloadKind::JsonArrayData => match serde_json::from_str::<Value>(data)? {
            Value::Array(values) => Ok(Payload::JsonArray(values)),
            other => Err(CodecError::KindMismatch {
                kind,
                detail: format!("expected a JSON array, found {}", json_type_name(&other)),
            }),
        },
        PayloadKind::BinaryData => Ok(Payload::Binary(binary::decode(data)?)),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Wraps a wire string in its length-prefixed byte frame.
///
/// # Errors
///
/// Fails when the string exceeds [`MAX_FRAME_LEN`] bytes.
pub fn encode_frame(text: &str) -> Result<Vec<u8>, CodecError> {
    let payload = text.as_bytes();
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            declared: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Pops one complete frame off the front of the receive buffer, if present.
///
/// Returns `Ok(None)` while the buffer holds only part of a frame. A frame
/// whose declared length exceeds [`MAX_FRAME_LEN`] is unrecoverable: the
/// stream can no longer be realigned, so the error is returned with the
/// buffer untouched and the connection must be dropped. A complete frame
/// that is not valid UTF-8 is consumed before the error is returned, so the
/// following frame can still be extracted.
pub fn extract_frame(buf: &mut Vec<u8>) -> Result<Option<String>, CodecError> {
    if buf.len() < FRAME_PREFIX_LEN {
        return Ok(None);
    }

    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            declared,
            max: MAX_FRAME_LEN,
        });
    }
    if buf.len() < FRAME_PREFIX_LEN + declared {
        return Ok(None);
    }

    let body: Vec<u8> = buf
        .drain(..FRAME_PREFIX_LEN + declared)
        .skip(FRAME_PREFIX_LEN)
        .collect();
    Ok(Some(String::from_utf8(body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::Command;
    use serde_json::{json, Map};

    /// Encodes an envelope and decodes it back, asserting the round trip is
    /// lossless.
    fn round_trip(payload: Payload) -> CommandEnvelope {
        let envelope = Command::new("probe", payload).envelope();
        let text = encode_envelope(&envelope).expect("encode must succeed");
        let decoded = decode_envelope(&text).expect("decode must succeed");
        assert_eq!(envelope, decoded, "decoded envelope must match the original");
        decoded
    }

    fn raw_envelope(id: &str, code: &str, tag: &str, data: &str) -> String {
        format!("{id}\u{1F}{code}\u{1F}{tag}\u{1F}{data}")
    }

    const SOME_ID: &str = "9f2f648a-07d1-4b9c-a3da-5e1a0b6c2f11";

    // ── Round trips ───────────────────────────────────────────────────────────

    #[test]
    fn test_round_trip_no_data() {
        let decoded = round_trip(Payload::None);
        assert_eq!(decoded.kind(), PayloadKind::NoData);
    }

    #[test]
    fn test_round_trip_text() {
        round_trip(Payload::Text("Hello".to_string()));
        round_trip(Payload::Text(String::new()));
        round_trip(Payload::Text("multi\nline\ttext with ünïcode ⚡".to_string()));
    }

    #[test]
    fn test_round_trip_json_object() {
        let mut map = Map::new();
        map.insert("os_name".to_string(), json!("linux"));
        map.insert("pid".to_string(), json!(4221));
        map.insert("tags".to_string(), json!(["a", "b"]));
        round_trip(Payload::JsonObject(map));
    }

    #[test]
    fn test_round_trip_json_array() {
        round_trip(Payload::JsonArray(vec![json!(1), json!("two"), json!(null)]));
        round_trip(Payload::JsonArray(Vec::new()));
    }

    #[test]
    fn test_round_trip_binary() {
        round_trip(Payload::Binary((0..=u8::MAX).collect()));
        round_trip(Payload::Binary(Vec::new()));
    }

    #[test]
    fn test_text_containing_separator_survives() {
        // The data field is last, so separator bytes inside it are harmless.
        let tricky = format!("before{}after{}end", '\u{1F}', '\u{1F}');
        let decoded = round_trip(Payload::Text(tricky.clone()));
        assert_eq!(decoded.payload, Payload::Text(tricky));
    }

    // ── Encode errors ─────────────────────────────────────────────────────────

    #[test]
    fn test_code_with_separator_is_rejected() {
        let envelope = Command::new(format!("bad{}code", '\u{1F}'), Payload::None).envelope();

        let result = encode_envelope(&envelope);

        assert!(
            matches!(result, Err(CodecError::InvalidCode { .. })),
            "got {result:?}"
        );
    }

    // ── Decode errors ─────────────────────────────────────────────────────────

    #[test]
    fn test_truncated_envelope_is_rejected() {
        let result = decode_envelope(&format!("{SOME_ID}\u{1F}print\u{1F}none"));
        assert!(matches!(result, Err(CodecError::TruncatedEnvelope)), "got {result:?}");

        let result = decode_envelope("");
        assert!(matches!(result, Err(CodecError::TruncatedEnvelope)), "got {result:?}");
    }

    #[test]
    fn test_invalid_id_is_rejected() {
        let result = decode_envelope(&raw_envelope("not-an-id", "print", "none", ""));
        assert!(matches!(result, Err(CodecError::InvalidId { .. })), "got {result:?}");
    }

    #[test]
    fn test_unknown_kind_tag_is_rejected() {
        let result = decode_envelope(&raw_envelope(SOME_ID, "print", "gzip", "data"));
        assert!(matches!(result, Err(CodecError::UnknownKind { .. })), "got {result:?}");
    }

    #[test]
    fn test_no_data_with_payload_is_rejected() {
        let result = decode_envelope(&raw_envelope(SOME_ID, "print", "none", "surprise"));
        assert!(matches!(result, Err(CodecError::KindMismatch { .. })), "got {result:?}");
    }

    #[test]
    fn test_object_tag_with_array_data_is_rejected() {
        let result = decode_envelope(&raw_envelope(SOME_ID, "print", "json-object", "[1,2]"));
        assert!(matches!(result, Err(CodecError::KindMismatch { .. })), "got {result:?}");
    }

    #[test]
    fn test_array_tag_with_scalar_data_is_rejected() {
        let result = decode_envelope(&raw_envelope(SOME_ID, "print", "json-array", "42"));
        assert!(matches!(result, Err(CodecError::KindMismatch { .. })), "got {result:?}");
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let result = decode_envelope(&raw_envelope(SOME_ID, "print", "json-object", "{oops"));
        assert!(matches!(result, Err(CodecError::InvalidJson(_))), "got {result:?}");
    }

    #[test]
    fn test_binary_tag_with_bad_base64_is_rejected() {
        let result = decode_envelope(&raw_envelope(SOME_ID, "print", "binary", "@@@@"));
        assert!(matches!(result, Err(CodecError::InvalidBinary(_))), "got {result:?}");
    }

    // ── Framing ───────────────────────────────────────────────────────────────

    #[test]
    fn test_frame_round_trip() {
        let mut buf = encode_frame("hello frame").expect("encode must succeed");

        let extracted = extract_frame(&mut buf).expect("extract must succeed");

        assert_eq!(extracted.as_deref(), Some("hello frame"));
        assert!(buf.is_empty(), "the frame must be consumed");
    }

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let frame = encode_frame("split delivery").expect("encode must succeed");

        // Only part of the prefix.
        let mut buf = frame[..2].to_vec();
        assert!(extract_frame(&mut buf).expect("must not fail").is_none());

        // Full prefix, partial body.
        buf = frame[..frame.len() - 3].to_vec();
        assert!(extract_frame(&mut buf).expect("must not fail").is_none());

        // Remaining bytes arrive.
        buf.extend_from_slice(&frame[frame.len() - 3..]);
        let extracted = extract_frame(&mut buf).expect("extract must succeed");
        assert_eq!(extracted.as_deref(), Some("split delivery"));
    }

    #[test]
    fn test_back_to_back_frames_extract_in_order() {
        let mut buf = encode_frame("first").expect("encode must succeed");
        buf.extend(encode_frame("second").expect("encode must succeed"));

        let first = extract_frame(&mut buf).expect("extract must succeed");
        let second = extract_frame(&mut buf).expect("extract must succeed");
        let third = extract_frame(&mut buf).expect("must not fail");

        assert_eq!(first.as_deref(), Some("first"));
        assert_eq!(second.as_deref(), Some("second"));
        assert!(third.is_none());
    }

    #[test]
    fn test_oversized_declared_length_is_fatal() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(b"garbage");

        let result = extract_frame(&mut buf);

        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })), "got {result:?}");
    }

    #[test]
    fn test_oversized_outbound_frame_is_rejected() {
        let text = "x".repeat(MAX_FRAME_LEN + 1);
        let result = encode_frame(&text);
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })), "got {result:?}");
    }

    #[test]
    fn test_invalid_utf8_frame_keeps_stream_alignment() {
        // Frame one: a correct prefix over bytes that are not UTF-8.
        let mut buf = vec![0, 0, 0, 2, 0xFF, 0xFE];
        buf.extend(encode_frame("still fine").expect("encode must succeed"));

        let bad = extract_frame(&mut buf);
        assert!(matches!(bad, Err(CodecError::InvalidUtf8(_))), "got {bad:?}");

        // The bad frame was consumed; the next one decodes normally.
        let good = extract_frame(&mut buf).expect("extract must succeed");
        assert_eq!(good.as_deref(), Some("still fine"));
    }
}
