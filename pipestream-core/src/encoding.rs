//! Payload encoding
//!
//! Turns application values into the `(header, payload)` byte pair carried by
//! the streaming bus and the data server. The header is small and fixed:
//! `[version:1][kind:1]`, so a peer configured with another encoding rejects
//! the payload instead of misreading it.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Current header format version
pub const HEADER_VERSION: u8 = 1;

/// Header length in bytes
pub const HEADER_LEN: usize = 2;

/// Supported payload encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingKind {
    Json,
}

impl EncodingKind {
    /// Resolve a configured encoding name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Json => 1,
        }
    }

    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Json),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
        }
    }
}

/// Encoder/decoder used for message payloads and control values
pub trait Encoding: Send + Sync {
    fn kind(&self) -> EncodingKind;

    /// Encode an application value into a header and payload
    fn encode_header_payload(&self, value: &Value) -> Result<(Bytes, Bytes)>;

    /// Decode a header and payload produced by `encode_header_payload`
    fn decode_header_payload(&self, header: &[u8], payload: &[u8]) -> Result<Value>;

    /// Encode a control value (no header)
    fn encode(&self, value: &Value) -> Result<Bytes>;

    /// Decode a control value
    fn decode(&self, data: &[u8]) -> Result<Value>;
}

/// Build the encoding registered under `name`
pub fn encoding_for(name: &str) -> Result<Arc<dyn Encoding>> {
    match EncodingKind::from_name(name) {
        Some(EncodingKind::Json) => Ok(Arc::new(JsonEncoding)),
        None => Err(Error::Configuration(format!("unsupported encoding '{name}'"))),
    }
}

/// JSON encoding backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoding;

impl JsonEncoding {
    fn header(self) -> Bytes {
        Bytes::from_static(&[HEADER_VERSION, 1])
    }

    fn check_header(self, header: &[u8]) -> Result<()> {
        if header.len() < HEADER_LEN {
            return Err(Error::Encoding(format!(
                "header too short: {} bytes",
                header.len()
            )));
        }
        if header[0] != HEADER_VERSION {
            return Err(Error::Encoding(format!(
                "unsupported header version {}",
                header[0]
            )));
        }
        match EncodingKind::from_byte(header[1]) {
            Some(EncodingKind::Json) => Ok(()),
            None => Err(Error::Encoding(format!("unknown encoding kind {}", header[1]))),
        }
    }
}

impl Encoding for JsonEncoding {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Json
    }

    fn encode_header_payload(&self, value: &Value) -> Result<(Bytes, Bytes)> {
        let payload = serde_json::to_vec(value)?;
        Ok((self.header(), Bytes::from(payload)))
    }

    fn decode_header_payload(&self, header: &[u8], payload: &[u8]) -> Result<Value> {
        self.check_header(header)?;
        Ok(serde_json::from_slice(payload)?)
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_payload() {
        let encoding = JsonEncoding;
        let value = json!({ "frame": 7, "labels": ["a", "b"] });
        let (header, payload) = encoding.encode_header_payload(&value).unwrap();

        assert_eq!(header.as_ref(), &[HEADER_VERSION, EncodingKind::Json.as_byte()]);
        assert_eq!(encoding.decode_header_payload(&header, &payload).unwrap(), value);
    }

    #[test]
    fn test_rejects_foreign_header() {
        let encoding = JsonEncoding;
        assert!(encoding.decode_header_payload(&[], b"{}").is_err());
        assert!(encoding.decode_header_payload(&[9, 1], b"{}").is_err());
        assert!(encoding.decode_header_payload(&[HEADER_VERSION, 42], b"{}").is_err());
    }

    #[test]
    fn test_encoding_for() {
        assert_eq!(encoding_for("JSON").unwrap().kind(), EncodingKind::Json);
        assert!(matches!(encoding_for("bson"), Err(Error::Configuration(_))));
    }
}
