//! Decoded uplink payloads

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Status word returned by most command responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCode {
    /// Raw payload as lowercase hex
    pub code: String,
    /// Payload read as a little-endian integer
    pub status: u64,
}

impl StatusCode {
    /// Read a status word from raw payload bytes
    pub fn from_payload(payload: &[u8]) -> Self {
        Self {
            code: hex::encode(payload),
            status: super::ByteOrder::Little.read_uint(payload),
        }
    }

    /// Whether the status equals the expected raw bytes
    pub fn is(&self, expected: &[u8]) -> bool {
        self.code == hex::encode(expected)
    }
}

/// Value produced by an operation's decode function
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Decoded {
    /// Payload passed through untouched
    Raw(#[serde(serialize_with = "serialize_hex")] Bytes),
    /// Status word
    Status(StatusCode),
    /// UTF-8 text
    Text(String),
    /// Structured fields
    Json(serde_json::Value),
}

fn serialize_hex<S: serde::Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

impl Decoded {
    /// Raw passthrough decode
    pub fn raw(payload: &[u8]) -> Self {
        Self::Raw(Bytes::copy_from_slice(payload))
    }

    /// Status word, if this is one
    pub fn as_status(&self) -> Option<&StatusCode> {
        match self {
            Self::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Raw bytes, if this is a passthrough
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Display for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(bytes) => write!(f, "{}", hex::encode(bytes)),
            Self::Status(status) => write!(f, "status({}, {})", status.code, status.status),
            Self::Text(text) => write!(f, "{text}"),
            Self::Json(value) => write!(f, "{value}"),
        }
    }
}

/// Decode function bound to an uplink header
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Decoded + Send + Sync>;

/// Decode function that passes the payload through
pub fn raw_decoder() -> DecodeFn {
    Arc::new(Decoded::raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code() {
        let status = StatusCode::from_payload(&[0x01, 0x00]);
        assert_eq!(status.code, "0100");
        assert_eq!(status.status, 1);
        assert!(status.is(&[0x01, 0x00]));
    }

    #[test]
    fn test_json_shape() {
        let value = serde_json::to_value(Decoded::raw(&[0xAB])).unwrap();
        assert_eq!(value, serde_json::json!({"type": "raw", "value": "ab"}));
    }
}
