//! Byte <-> typed-message conversion, tagged by content type.
//!
//! Serializers work on `serde_json::Value` at the trait boundary so the
//! registry stays object-safe; typed encode/decode helpers sit on the
//! registry. Two rules every implementation honors: encoding equal inputs
//! yields equal bytes (fingerprints stay meaningful), and decode rejects
//! trailing bytes.

use crate::error::DispatchError;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_BSON: &str = "application/x-bson";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown content type: {0}")]
    UnknownContentType(String),

    #[error("duplicate serializer for {0}")]
    DuplicateContentType(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

impl From<CodecError> for DispatchError {
    fn from(e: CodecError) -> Self {
        DispatchError::Terminal(e.to_string())
    }
}

pub trait Serializer: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn encode(&self, value: &serde_json::Value) -> Result<Bytes, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError>;
}

/// JSON serializer. `serde_json` maps are ordered, so encoding is
/// deterministic, and `from_slice` errors on trailing characters.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// BSON serializer. The value rides in a single-key document because BSON's
/// top level must be a document.
pub struct BsonSerializer;

const BSON_WRAPPER_KEY: &str = "v";

impl Serializer for BsonSerializer {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_BSON
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Bytes, CodecError> {
        let body = bson::Bson::try_from(value.clone())
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        let mut doc = bson::Document::new();
        doc.insert(BSON_WRAPPER_KEY, body);
        let mut buf = Vec::new();
        doc.to_writer(&mut buf)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        // from_reader advances the slice; anything left over is trailing junk.
        let mut reader = bytes;
        let doc = bson::Document::from_reader(&mut reader)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        if !reader.is_empty() {
            return Err(CodecError::Decode(format!(
                "{} trailing bytes after document",
                reader.len()
            )));
        }
        let body = doc
            .get(BSON_WRAPPER_KEY)
            .cloned()
            .ok_or_else(|| CodecError::Decode("missing wrapper key".to_string()))?;
        Ok(body.into())
    }
}

/// Frozen content-type -> serializer map, built at startup.
pub struct SerializerRegistry {
    by_content_type: HashMap<&'static str, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self {
            by_content_type: HashMap::new(),
        }
    }

    /// Registry preloaded with the JSON and BSON serializers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(JsonSerializer))
            .expect("fresh registry");
        registry
            .register(Arc::new(BsonSerializer))
            .expect("fresh registry");
        registry
    }

    /// Registering the same content type twice is a startup error.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) -> Result<(), CodecError> {
        let ct = serializer.content_type();
        if self.by_content_type.contains_key(ct) {
            return Err(CodecError::DuplicateContentType(ct.to_string()));
        }
        self.by_content_type.insert(ct, serializer);
        Ok(())
    }

    pub fn get(&self, content_type: &str) -> Result<&Arc<dyn Serializer>, CodecError> {
        self.by_content_type
            .get(content_type)
            .ok_or_else(|| CodecError::UnknownContentType(content_type.to_string()))
    }

    pub fn encode_message<T: serde::Serialize>(
        &self,
        content_type: &str,
        message: &T,
    ) -> Result<Bytes, CodecError> {
        let value = serde_json::to_value(message).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.get(content_type)?.encode(&value)
    }

    pub fn decode_message<T: serde::de::DeserializeOwned>(
        &self,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<T, CodecError> {
        let value = self.get(content_type)?.decode(bytes)?;
        serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn sample() -> Sample {
        Sample {
            name: "order".to_string(),
            count: 3,
        }
    }

    #[test]
    fn json_round_trip() {
        let registry = SerializerRegistry::with_defaults();
        let bytes = registry.encode_message(CONTENT_TYPE_JSON, &sample()).unwrap();
        let back: Sample = registry.decode_message(CONTENT_TYPE_JSON, &bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn bson_round_trip() {
        let registry = SerializerRegistry::with_defaults();
        let bytes = registry.encode_message(CONTENT_TYPE_BSON, &sample()).unwrap();
        let back: Sample = registry.decode_message(CONTENT_TYPE_BSON, &bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn json_encoding_is_deterministic() {
        let registry = SerializerRegistry::with_defaults();
        let a = registry.encode_message(CONTENT_TYPE_JSON, &sample()).unwrap();
        let b = registry.encode_message(CONTENT_TYPE_JSON, &sample()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn json_rejects_trailing_bytes() {
        let registry = SerializerRegistry::with_defaults();
        let err = registry
            .decode_message::<Sample>(CONTENT_TYPE_JSON, br#"{"name":"x","count":1}garbage"#)
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn bson_rejects_trailing_bytes() {
        let registry = SerializerRegistry::with_defaults();
        let mut bytes = registry
            .encode_message(CONTENT_TYPE_BSON, &sample())
            .unwrap()
            .to_vec();
        bytes.extend_from_slice(b"tail");
        let err = registry
            .decode_message::<Sample>(CONTENT_TYPE_BSON, &bytes)
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn unknown_content_type_is_an_error() {
        let registry = SerializerRegistry::with_defaults();
        let err = registry
            .encode_message("application/x-unknown", &sample())
            .unwrap_err();
        assert!(matches!(err, CodecError::UnknownContentType(_)));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = SerializerRegistry::with_defaults();
        let err = registry.register(Arc::new(JsonSerializer)).unwrap_err();
        assert!(matches!(err, CodecError::DuplicateContentType(_)));
    }
}
