//! Codec contract and content-type registry.
//!
//! Codecs marshal between raw bytes and the dynamic `serde_json::Value`
//! tree; typed payloads bridge through the tree via [`encode`] / [`decode`].
//! A [`CodecRegistry`] maps content types (including aliases) to codecs and
//! is consulted at every boundary. Registries are constructed at start-up
//! and passed by reference rather than accessed through globals.

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgpackCodec;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

pub enum CodecError {
    Marshal(String),
    Unmarshal(String),
    UnknownContentType(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Marshal(msg) => write!(f, "marshal failed: {msg}"),
            CodecError::Unmarshal(msg) => write!(f, "unmarshal failed: {msg}"),
            CodecError::UnknownContentType(ct) => write!(f, "no codec for content type {ct:?}"),
        }
    }
}

impl std::fmt::Debug for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for CodecError {}

/// Marshal/unmarshal pair over one content type.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;
    fn content_type(&self) -> &'static str;
    fn extension(&self) -> &'static str;

    /// Alternative content-type strings that resolve to this codec.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    fn marshal(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError>;
    fn unmarshal(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError>;

    /// Cheap sniff: could these bytes plausibly be this codec's format?
    /// Consulted when no content-type header is present.
    fn detect(&self, bytes: &[u8]) -> bool;

    /// Full validation: do these bytes parse?
    fn valid(&self, bytes: &[u8]) -> bool;
}

/// Marshal a typed value through the dynamic tree.
pub fn encode<T: Serialize>(codec: &dyn Codec, value: &T) -> Result<Vec<u8>, CodecError> {
    let tree = serde_json::to_value(value).map_err(|e| CodecError::Marshal(e.to_string()))?;
    codec.marshal(&tree)
}

/// Unmarshal bytes into a typed value through the dynamic tree.
pub fn decode<T: DeserializeOwned>(codec: &dyn Codec, bytes: &[u8]) -> Result<T, CodecError> {
    let tree = codec.unmarshal(bytes)?;
    serde_json::from_value(tree).map_err(|e| CodecError::Unmarshal(e.to_string()))
}

/// Content-type directory consulted by every boundary.
pub struct CodecRegistry {
    by_content_type: RwLock<HashMap<String, Arc<dyn Codec>>>,
    codecs: RwLock<Vec<Arc<dyn Codec>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        CodecRegistry {
            by_content_type: RwLock::new(HashMap::new()),
            codecs: RwLock::new(Vec::new()),
        }
    }

    /// Registry preloaded with the mandatory JSON and MessagePack codecs.
    pub fn with_defaults() -> Self {
        let registry = CodecRegistry::new();
        registry.register(Arc::new(JsonCodec));
        registry.register(Arc::new(MsgpackCodec));
        registry
    }

    /// Register a codec under its content type and every alias.
    pub fn register(&self, codec: Arc<dyn Codec>) {
        let mut map = self.by_content_type.write().unwrap();
        map.insert(codec.content_type().to_string(), codec.clone());
        for alias in codec.aliases() {
            map.insert(alias.to_string(), codec.clone());
        }
        self.codecs.write().unwrap().push(codec);
    }

    /// Look up by content type. Parameters (`; charset=...`) are ignored.
    pub fn get(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        let base = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();
        self.by_content_type.read().unwrap().get(&base).cloned()
    }

    /// Find a codec whose sniff accepts these bytes. First match wins, in
    /// registration order.
    pub fn sniff(&self, bytes: &[u8]) -> Option<Arc<dyn Codec>> {
        self.codecs
            .read()
            .unwrap()
            .iter()
            .find(|c| c.detect(bytes))
            .cloned()
    }

    /// Server-side negotiation: the request `Content-Type` picks the request
    /// codec, the `Accept` header (first acceptable entry) picks the
    /// response codec, falling back to the request codec. `None` means no
    /// registered codec matched and the caller must answer 415.
    pub fn negotiate(
        &self,
        content_type: &str,
        accept: Option<&str>,
    ) -> Option<(Arc<dyn Codec>, Arc<dyn Codec>)> {
        let request_codec = self.get(content_type)?;
        let response_codec = accept
            .and_then(|accept| {
                accept
                    .split(',')
                    .filter_map(|entry| self.get(entry))
                    .next()
            })
            .unwrap_or_else(|| request_codec.clone());
        Some((request_codec, response_codec))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistry::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        count: u32,
    }

    #[test]
    fn json_round_trip() {
        let codec = JsonCodec;
        let value = Payload {
            name: "World".into(),
            count: 3,
        };
        let bytes = encode(&codec, &value).unwrap();
        let back: Payload = decode(&codec, &bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn msgpack_round_trip() {
        let codec = MsgpackCodec;
        let value = Payload {
            name: "World".into(),
            count: 3,
        };
        let bytes = encode(&codec, &value).unwrap();
        let back: Payload = decode(&codec, &bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn registry_resolves_aliases() {
        let registry = CodecRegistry::with_defaults();
        for ct in [
            "application/msgpack",
            "msgpack",
            "application/x-msgpack",
            "application/vnd.msgpack",
        ] {
            let codec = registry.get(ct).expect(ct);
            assert_eq!(codec.name(), "msgpack");
        }
        assert_eq!(registry.get("application/json").unwrap().name(), "json");
        assert!(registry.get("text/html").is_none());
    }

    #[test]
    fn registry_strips_parameters() {
        let registry = CodecRegistry::with_defaults();
        let codec = registry.get("application/json; charset=utf-8").unwrap();
        assert_eq!(codec.name(), "json");
    }

    #[test]
    fn negotiation_prefers_accept_then_falls_back() {
        let registry = CodecRegistry::with_defaults();

        let (req, resp) = registry
            .negotiate("application/json", Some("application/msgpack"))
            .unwrap();
        assert_eq!(req.name(), "json");
        assert_eq!(resp.name(), "msgpack");

        // Unacceptable Accept entries fall back to the request codec.
        let (_, resp) = registry
            .negotiate("application/json", Some("text/html, application/xml"))
            .unwrap();
        assert_eq!(resp.name(), "json");

        // Unknown request content type means 415 at the caller.
        assert!(registry.negotiate("text/html", None).is_none());
    }

    #[test]
    fn sniff_distinguishes_formats() {
        let registry = CodecRegistry::with_defaults();
        assert_eq!(registry.sniff(b"  {\"a\":1}").unwrap().name(), "json");
        let packed = rmp_serde::to_vec_named(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(registry.sniff(&packed).unwrap().name(), "msgpack");
    }
}
