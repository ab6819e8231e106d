use super::{Codec, CodecError};

/// Self-describing textual codec over `application/json`.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    fn marshal(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Marshal(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Unmarshal(e.to_string()))
    }

    fn detect(&self, bytes: &[u8]) -> bool {
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(&b) => matches!(b, b'{' | b'[' | b'"' | b'-' | b'0'..=b'9' | b't' | b'f' | b'n'),
            None => false,
        }
    }

    fn valid(&self, bytes: &[u8]) -> bool {
        serde_json::from_slice::<serde::de::IgnoredAny>(bytes).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_accepts_json_shapes() {
        let codec = JsonCodec;
        assert!(codec.detect(b"{\"a\":1}"));
        assert!(codec.detect(b"  [1,2]"));
        assert!(codec.detect(b"\"str\""));
        assert!(codec.detect(b"true"));
        assert!(!codec.detect(b""));
        assert!(!codec.detect(&[0x82, 0xa1]));
    }

    #[test]
    fn valid_rejects_garbage() {
        let codec = JsonCodec;
        assert!(codec.valid(b"{\"a\": [1, 2, 3]}"));
        assert!(!codec.valid(b"{\"a\": "));
        assert!(!codec.valid(b"{trailing} junk"));
    }
}
