use super::{Codec, CodecError};

/// Compact binary codec over `application/msgpack`.
///
/// Maps are written with string keys (`to_vec_named`) so payloads stay
/// interchangeable with the JSON codec.
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn content_type(&self) -> &'static str {
        "application/msgpack"
    }

    fn extension(&self) -> &'static str {
        "msgpack"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["msgpack", "application/x-msgpack", "application/vnd.msgpack"]
    }

    fn marshal(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(value).map_err(|e| CodecError::Marshal(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Unmarshal(e.to_string()))
    }

    fn detect(&self, bytes: &[u8]) -> bool {
        // First-byte markers: fixmap/fixarray/fixstr, nil, bool, the
        // float/int/str/bin/array/map families, and negative fixint.
        match bytes.first() {
            Some(&b) => matches!(
                b,
                0x80..=0xbf | 0xc0 | 0xc2 | 0xc3 | 0xc4..=0xc6 | 0xca..=0xd3 | 0xd9..=0xdf | 0xe0..=0xff
            ),
            None => false,
        }
    }

    fn valid(&self, bytes: &[u8]) -> bool {
        rmp_serde::from_slice::<serde::de::IgnoredAny>(bytes).is_ok()
    }
}
