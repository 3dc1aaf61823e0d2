//! Operation definitions
//!
//! An operation is one remote command: where it goes (model id + opcode),
//! which uplink headers answer it, how arguments become a payload and how
//! the response payload is decoded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::DeviceError;
use crate::core::protocol::value::raw_decoder;
use crate::core::protocol::{ByteOrder, DecodeFn, Decoded, ProtocolConfig, StatusCode};

/// Call arguments: a JSON object keyed by parameter name
pub type Args = serde_json::Value;

/// Encode function: `None` means the operation sends no frame
pub type EncodeFn = Arc<dyn Fn(&Args) -> Result<Option<Bytes>, DeviceError> + Send + Sync>;

/// Parameter value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Unsigned 8-bit integer
    U8,
    /// Unsigned 16-bit integer
    U16,
    /// Unsigned 32-bit integer
    U32,
    /// Signed 8-bit integer
    I8,
    /// Signed 16-bit integer
    I16,
    /// Signed 32-bit integer
    I32,
    /// Boolean (1 byte)
    Bool,
    /// Hex string, copied verbatim
    Bytes,
    /// UTF-8 string, copied verbatim
    Str,
}

impl ParamKind {
    /// Fixed width in bytes, `None` for variable-length kinds
    pub fn width(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 | Self::Bool => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 => Some(4),
            Self::Bytes | Self::Str => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::Bool => "bool",
            Self::Bytes => "bytes",
            Self::Str => "str",
        }
    }
}

/// One named parameter of an operation's signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name
    pub name: String,
    /// Value type
    #[serde(rename = "type")]
    pub kind: ParamKind,
    /// Value used when the argument is missing
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

impl Param {
    /// Required parameter
    pub fn new(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default: None,
        }
    }

    /// Parameter with a default value
    #[must_use]
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Pack `value` little-endian into `out`
    pub fn pack(&self, value: &serde_json::Value, out: &mut Vec<u8>) -> Result<(), DeviceError> {
        let bad = |expected: &str| DeviceError::Encode(format!("'{}' expects {}, got {}", self.name, expected, value));
        match self.kind {
            ParamKind::Bytes => {
                let text = value.as_str().ok_or_else(|| bad("a hex string"))?;
                out.extend(hex::decode(text.replace(' ', "")).map_err(|_| bad("a hex string"))?);
            }
            ParamKind::Str => {
                out.extend_from_slice(value.as_str().ok_or_else(|| bad("a string"))?.as_bytes());
            }
            ParamKind::Bool => {
                out.push(u8::from(value.as_bool().ok_or_else(|| bad("a boolean"))?));
            }
            kind => {
                let width = kind.width().unwrap_or(0);
                let raw = match kind {
                    ParamKind::I8 | ParamKind::I16 | ParamKind::I32 => {
                        let v = value.as_i64().ok_or_else(|| bad("an integer"))?;
                        let bits = 8 * width as u32;
                        let min = -(1i64 << (bits - 1));
                        let max = (1i64 << (bits - 1)) - 1;
                        if v < min || v > max {
                            return Err(bad(kind.name()));
                        }
                        v as u64
                    }
                    _ => {
                        let v = value.as_u64().ok_or_else(|| bad("an unsigned integer"))?;
                        if width < 8 && v >> (8 * width) != 0 {
                            return Err(bad(kind.name()));
                        }
                        v
                    }
                };
                out.extend(ByteOrder::Little.write_uint(raw, width));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.kind.name())?;
        if let Some(default) = &self.default {
            write!(f, " = {default}")?;
        }
        Ok(())
    }
}

/// Where an operation's responses come from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Uplink {
    /// `uplink_code + model_id + opcode`
    #[default]
    Default,
    /// `uplink_code + model_id + alternate opcode`
    Opcode(Vec<u8>),
    /// Explicit header list; the last one is authoritative
    Headers(Vec<Vec<u8>>),
}

/// A registered remote command
#[derive(Clone)]
pub struct Operation {
    /// Lookup name
    pub name: String,
    /// Second lookup name
    pub alias: Option<String>,
    /// One-line description
    pub doc: String,
    /// Model id, zero-padded on the wire
    pub model_id: Vec<u8>,
    /// Opcode, zero-padded on the wire
    pub opcode: Vec<u8>,
    /// Response headers
    pub uplink: Uplink,
    /// Argument signature
    pub params: Vec<Param>,
    /// Arguments → payload
    pub encode: EncodeFn,
    /// Response payload → value
    pub decode: DecodeFn,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("model_id", &hex::encode(&self.model_id))
            .field("opcode", &hex::encode(&self.opcode))
            .field("uplink", &self.uplink)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Operation {
    /// Operation with an empty payload and a status-word response
    pub fn new(name: &str, model_id: &[u8], opcode: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            alias: None,
            doc: String::new(),
            model_id: model_id.to_vec(),
            opcode: opcode.to_vec(),
            uplink: Uplink::Default,
            params: Vec::new(),
            encode: empty_encoder(),
            decode: status_decoder(),
        }
    }

    /// Set the alias
    #[must_use]
    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    /// Set the description
    #[must_use]
    pub fn with_doc(mut self, doc: &str) -> Self {
        self.doc = doc.split_whitespace().collect::<Vec<_>>().join(" ");
        self
    }

    /// Set the argument signature
    #[must_use]
    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        self.params = params;
        self
    }

    /// Set the encode function
    #[must_use]
    pub fn with_encoder(mut self, encode: EncodeFn) -> Self {
        self.encode = encode;
        self
    }

    /// Set the decode function
    #[must_use]
    pub fn with_decoder(mut self, decode: DecodeFn) -> Self {
        self.decode = decode;
        self
    }

    /// Answered on an alternate opcode
    #[must_use]
    pub fn with_uplink_opcode(mut self, opcode: &[u8]) -> Self {
        self.uplink = Uplink::Opcode(opcode.to_vec());
        self
    }

    /// Answered on explicit headers
    #[must_use]
    pub fn with_uplink_headers(mut self, headers: Vec<Vec<u8>>) -> Self {
        self.uplink = Uplink::Headers(headers);
        self
    }

    /// Names this operation is reachable under
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.alias.as_deref())
    }

    /// Full downlink header
    pub fn downlink_header(&self, config: &ProtocolConfig) -> Vec<u8> {
        config.downlink_header_for(&self.model_id, &self.opcode)
    }

    /// Expected uplink headers, in declared order
    pub fn uplink_headers(&self, config: &ProtocolConfig) -> Vec<Vec<u8>> {
        match &self.uplink {
            Uplink::Default => vec![config.uplink_header_for(&self.model_id, &self.opcode)],
            Uplink::Opcode(opcode) => vec![config.uplink_header_for(&self.model_id, opcode)],
            Uplink::Headers(headers) => headers.clone(),
        }
    }

    /// `name(param: type, ...)`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        format!("{}({})", self.name, params.join(", "))
    }

    /// Run the encode function
    pub fn encode(&self, args: &Args) -> Result<Option<Bytes>, DeviceError> {
        (self.encode)(args)
    }
}

/// Always sends an empty payload
pub fn empty_encoder() -> EncodeFn {
    Arc::new(|_: &Args| -> Result<Option<Bytes>, DeviceError> { Ok(Some(Bytes::new())) })
}

/// Sends no frame at all
pub fn listen_encoder() -> EncodeFn {
    Arc::new(|_: &Args| -> Result<Option<Bytes>, DeviceError> { Ok(None) })
}

/// Sends fixed bytes
pub fn hex_encoder(payload: Vec<u8>) -> EncodeFn {
    let payload = Bytes::from(payload);
    Arc::new(move |_: &Args| -> Result<Option<Bytes>, DeviceError> { Ok(Some(payload.clone())) })
}

/// Packs arguments in signature order
pub fn fields_encoder(params: Vec<Param>) -> EncodeFn {
    Arc::new(move |args: &Args| -> Result<Option<Bytes>, DeviceError> {
        let mut out = Vec::new();
        for param in &params {
            let value = args
                .get(&param.name)
                .filter(|v| !v.is_null())
                .or(param.default.as_ref())
                .ok_or_else(|| DeviceError::Encode(format!("missing argument '{}'", param.name)))?;
            param.pack(value, &mut out)?;
        }
        Ok(Some(Bytes::from(out)))
    })
}

/// Status word decode
pub fn status_decoder() -> DecodeFn {
    Arc::new(|payload: &[u8]| Decoded::Status(StatusCode::from_payload(payload)))
}

/// UTF-8 (lossy) decode
pub fn text_decoder() -> DecodeFn {
    Arc::new(|payload: &[u8]| Decoded::Text(String::from_utf8_lossy(payload).into_owned()))
}

/// Unpacks little-endian fields into a JSON object; leftover bytes go to `rest`
pub fn fields_decoder(params: Vec<Param>) -> DecodeFn {
    Arc::new(move |payload: &[u8]| {
        let mut map = serde_json::Map::new();
        let mut cursor = 0;
        for param in &params {
            let value = match param.kind.width() {
                Some(width) => {
                    let Some(bytes) = payload.get(cursor..cursor + width) else {
                        break;
                    };
                    cursor += width;
                    let raw = ByteOrder::Little.read_uint(bytes);
                    match param.kind {
                        ParamKind::Bool => serde_json::Value::from(raw != 0),
                        ParamKind::I8 => serde_json::Value::from(raw as u8 as i8),
                        ParamKind::I16 => serde_json::Value::from(raw as u16 as i16),
                        ParamKind::I32 => serde_json::Value::from(raw as u32 as i32),
                        _ => serde_json::Value::from(raw),
                    }
                }
                None => {
                    let rest = &payload[cursor.min(payload.len())..];
                    cursor = payload.len();
                    match param.kind {
                        ParamKind::Str => serde_json::Value::from(String::from_utf8_lossy(rest).into_owned()),
                        _ => serde_json::Value::from(hex::encode(rest)),
                    }
                }
            };
            map.insert(param.name.clone(), value);
        }
        if cursor < payload.len() {
            map.insert("rest".into(), serde_json::Value::from(hex::encode(&payload[cursor..])));
        }
        Decoded::Json(serde_json::Value::Object(map))
    })
}

/// Raw passthrough decode
pub fn passthrough_decoder() -> DecodeFn {
    raw_decoder()
}
