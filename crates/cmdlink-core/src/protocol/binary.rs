//! Reversible byte↔string transform for binary payloads.
//!
//! The wire frame is a UTF-8 string, so raw bytes are carried as standard
//! base64 text. `decode(encode(b)) == b` holds for every byte sequence,
//! including the empty one.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Encodes bytes into text safe to embed in a frame.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes text produced by [`encode`] back into the original bytes.
pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slice_round_trips() {
        let encoded = encode(&[]);
        assert_eq!(encoded, "");
        assert_eq!(decode(&encoded).expect("decode must succeed"), Vec::<u8>::new());
    }

    #[test]
    fn test_arbitrary_bytes_round_trip() {
        let original: Vec<u8> = (0..=u8::MAX).collect();

        let decoded = decode(&encode(&original)).expect("decode must succeed");

        assert_eq!(decoded, original, "all 256 byte values must survive");
    }

    #[test]
    fn test_non_utf8_bytes_round_trip() {
        // 0xFF 0xFE is not valid UTF-8, which is exactly why the transform exists.
        let original = vec![0xFF, 0xFE, 0x00, 0x80];

        let encoded = encode(&original);

        assert!(encoded.is_ascii(), "encoded form must be plain text");
        assert_eq!(decode(&encoded).expect("decode must succeed"), original);
    }

    #[test]
    fn test_invalid_text_is_rejected() {
        assert!(decode("not base64!!").is_err());
    }
}
