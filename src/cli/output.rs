//! Output formatting

use clap::ValueEnum;
use serde_json::{json, Value};

use crate::core::protocol::{Decoded, Frame, FrameKind, FramePayload};

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON for scripting
    Json,
}

/// Space-separated hex bytes
pub fn hex_format(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

fn kind_name(kind: FrameKind) -> &'static str {
    match kind {
        FrameKind::Command => "command",
        FrameKind::DeviceInfo => "device_info",
        FrameKind::Log => "log",
    }
}

/// JSON view of a frame
pub fn frame_json(frame: &Frame) -> Value {
    let payload = match &frame.payload {
        FramePayload::Binary(bytes) => Value::String(hex::encode(bytes)),
        FramePayload::Text(text) => Value::String(text.clone()),
    };
    json!({
        "kind": kind_name(frame.kind),
        "header": hex::encode(&frame.header),
        "data_len": frame.data_len,
        "payload": payload,
        "checksum": hex::encode(&frame.checksum),
        "length": frame.length,
        "raw": hex::encode(&frame.raw_data),
    })
}

/// JSON view of a decoded value; absent values are `null`
pub fn decoded_json(value: Option<&Decoded>) -> Value {
    value
        .and_then(|v| serde_json::to_value(v).ok())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{FrameCodec, ProtocolConfig};
    use std::sync::Arc;

    #[test]
    fn test_hex_format() {
        assert_eq!(hex_format(&[0xAA, 0x00, 0x01]), "aa 00 01");
        assert_eq!(hex_format(&[]), "");
    }

    #[test]
    fn test_frame_json() {
        let codec = FrameCodec::new(Arc::new(ProtocolConfig::default()));
        let bytes = codec.encode_command(&[0x00], &[0x01], b"HI");
        let (frames, _) = codec.decode_stream(&bytes);
        let value = frame_json(&frames[0]);
        assert_eq!(value["kind"], "command");
        assert_eq!(value["header"], "aa0001");
        assert_eq!(value["payload"], "4849");
        assert_eq!(value["checksum"], "c2");
    }

    #[test]
    fn test_absent_is_null() {
        assert_eq!(decoded_json(None), Value::Null);
    }
}
