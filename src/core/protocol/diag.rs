//! Structured diagnostic log decoding
//!
//! Diagnostic frames start with the configured diagnostic header and a
//! sub-format marker:
//!
//! - `0xD8`: fixed 5-byte frame
//! - `0xD9`: length byte at offset 4, frame is `4 + len + 2` bytes
//!
//! The log type lives in the top six bits of byte 2, the log info in the low
//! ten bits of bytes 2..4 (big-endian), and the value starts at byte 5
//! (little-endian). Names, value types and enum labels come from an external
//! field-description table; anything missing from the table degrades to the
//! raw hex dump.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

use super::framing::{Frame, FrameKind, FramePayload, Parse};

/// Fixed-size sub-format marker
pub const MARKER_FIXED: u8 = 0xD8;
/// Variable-size sub-format marker
pub const MARKER_VARIABLE: u8 = 0xD9;

const FIXED_FRAME_SIZE: usize = 5;
const VALUE_OFFSET: usize = 5;

/// Value encoding of a diagnostic field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    /// Unsigned 8-bit
    U8,
    /// Unsigned 16-bit
    U16,
    /// Unsigned 32-bit
    U32,
    /// Signed 8-bit
    S8,
    /// Signed 16-bit
    S16,
    /// Signed 32-bit
    S32,
    /// 32-bit float
    Float,
    /// 8-bit enumeration
    Enum8,
    /// 16-bit enumeration
    Enum16,
    /// 32-bit enumeration
    Enum32,
    /// 8-bit bitmap
    Bitmap8,
    /// 16-bit bitmap
    Bitmap16,
    /// 32-bit bitmap
    Bitmap32,
}

impl ValueType {
    /// Width in bytes
    pub fn width(self) -> usize {
        match self {
            Self::U8 | Self::S8 | Self::Enum8 | Self::Bitmap8 => 1,
            Self::U16 | Self::S16 | Self::Enum16 | Self::Bitmap16 => 2,
            Self::U32 | Self::S32 | Self::Float | Self::Enum32 | Self::Bitmap32 => 4,
        }
    }

    /// Whether values are rendered through an enum label map
    pub fn is_enum(self) -> bool {
        matches!(self, Self::Enum8 | Self::Enum16 | Self::Enum32)
    }
}

/// Description of one diagnostic value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldEntry {
    /// Log type name
    pub log_type: String,
    /// Log info name
    pub log_info: String,
    /// Human-readable prefix
    #[serde(default)]
    pub description: String,
    /// Value encoding
    pub value_type: ValueType,
    /// Enum value → label
    #[serde(default)]
    pub items: BTreeMap<u32, String>,
}

/// Field-description table as supplied on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagTable {
    /// Log type code → name
    #[serde(default)]
    pub log_types: BTreeMap<u8, String>,
    /// Log type name → (log info code → name)
    #[serde(default)]
    pub log_infos: BTreeMap<String, BTreeMap<u16, String>>,
    /// Value descriptions
    #[serde(default)]
    pub fields: Vec<FieldEntry>,
}

/// Diagnostic table loading errors
#[derive(Error, Debug)]
pub enum DiagTableError {
    /// File could not be read
    #[error("Failed to read diagnostic table {path}: {source}")]
    Io {
        /// Table path
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// YAML syntax or schema error
    #[error("Invalid diagnostic table: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON syntax or schema error
    #[error("Invalid diagnostic table: {0}")]
    Json(#[from] serde_json::Error),
}

impl DiagTable {
    /// Load a table from a `.json`, `.yaml` or `.yml` file
    pub fn load(path: &Path) -> Result<Self, DiagTableError> {
        let content = std::fs::read_to_string(path).map_err(|source| DiagTableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Ok(serde_yaml::from_str(&content)?),
        }
    }
}

#[derive(Debug, Clone)]
struct FieldDesc {
    value_type: ValueType,
    description: String,
    labels: HashMap<u32, String>,
}

/// Diagnostic frame decoder, built once per session
#[derive(Debug, Clone, Default)]
pub struct DiagDecoder {
    types: HashMap<u8, String>,
    infos: HashMap<(String, u16), String>,
    fields: HashMap<(String, String), FieldDesc>,
}

impl DiagDecoder {
    /// Build the lookup maps from a table
    pub fn new(table: DiagTable) -> Self {
        let types = table.log_types.into_iter().collect();
        let infos = table
            .log_infos
            .into_iter()
            .flat_map(|(ty, infos)| {
                infos
                    .into_iter()
                    .map(move |(code, name)| ((ty.clone(), code), name))
            })
            .collect();
        let fields = table
            .fields
            .into_iter()
            .map(|f| {
                let desc = FieldDesc {
                    value_type: f.value_type,
                    description: f.description,
                    labels: f.items.into_iter().collect(),
                };
                ((f.log_type, f.log_info), desc)
            })
            .collect();
        Self { types, infos, fields }
    }

    /// Load the table at `path` and build a decoder
    pub fn from_file(path: &Path) -> Result<Self, DiagTableError> {
        Ok(Self::new(DiagTable::load(path)?))
    }

    /// Split a diagnostic frame off the front of `data`
    pub(crate) fn parse_frame(&self, data: &[u8]) -> Parse {
        let Some(&marker) = data.get(1) else {
            return Parse::Incomplete;
        };
        let (size, data_len) = match marker {
            MARKER_FIXED => (FIXED_FRAME_SIZE, FIXED_FRAME_SIZE - 1),
            MARKER_VARIABLE => match data.get(4) {
                Some(&len) => (4 + usize::from(len) + 2, usize::from(len)),
                None => return Parse::Incomplete,
            },
            _ => return Parse::Invalid,
        };
        if data.len() < size {
            return Parse::Incomplete;
        }
        let raw = &data[..size];
        Parse::Frame(Frame {
            kind: FrameKind::Log,
            header: Bytes::copy_from_slice(&raw[..1]),
            data_len,
            payload: FramePayload::Text(self.render(raw)),
            checksum: Bytes::new(),
            length: size,
            raw_data: Bytes::copy_from_slice(raw),
        })
    }

    /// Render a raw diagnostic frame as annotated text
    pub fn render(&self, raw: &[u8]) -> String {
        let log_type = raw
            .get(2)
            .and_then(|b| self.types.get(&(b >> 2)))
            .cloned()
            .unwrap_or_default();

        let log_info = match raw.get(2..4) {
            Some(bytes) => {
                let code = u16::from_be_bytes([bytes[0], bytes[1]]) & 0x3FF;
                self.infos
                    .get(&(log_type.clone(), code))
                    .cloned()
                    .unwrap_or_default()
            }
            None => String::new(),
        };

        let para = self
            .fields
            .get(&(log_type.clone(), log_info.clone()))
            .map(|desc| {
                let start = VALUE_OFFSET.min(raw.len());
                let end = (VALUE_OFFSET + desc.value_type.width()).min(raw.len());
                let value = super::ByteOrder::Little.read_uint(&raw[start..end]);
                if desc.value_type.is_enum() {
                    u32::try_from(value)
                        .ok()
                        .and_then(|v| desc.labels.get(&v))
                        .map(|label| format!("{}{}", desc.description, label))
                        .unwrap_or_default()
                } else {
                    format!("{}{:#x}", desc.description, value)
                }
            })
            .unwrap_or_default();

        let mut text = String::new();
        for part in [&log_type, &log_info, &para] {
            if !part.is_empty() {
                text.push('[');
                text.push_str(part);
                text.push(']');
            }
        }
        text.push_str(&format!("[raw_data:{}]", hex::encode(raw)));
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
log_types:
  1: SYS
log_infos:
  SYS:
    3: BOOT
    4: VOLT
fields:
  - log_type: SYS
    log_info: BOOT
    description: "reason "
    value_type: ENUM8
    items:
      0: POWER_ON
      1: WATCHDOG
  - log_type: SYS
    log_info: VOLT
    description: "mv="
    value_type: U16
"#;

    fn decoder() -> DiagDecoder {
        DiagDecoder::new(serde_yaml::from_str(TABLE).unwrap())
    }

    // Byte 2 = 0b0000_0100 -> type 1; bytes 2..4 = 0x0403 & 0x3FF -> info 3
    fn variable_frame(info: u8, value: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xC7, MARKER_VARIABLE, 0x04, info, value.len() as u8 + 1];
        frame.extend_from_slice(value);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame
    }

    #[test]
    fn test_enum_value() {
        let raw = variable_frame(0x03, &[0x01]);
        let text = decoder().render(&raw);
        assert_eq!(
            text,
            format!("[SYS][BOOT][reason WATCHDOG][raw_data:{}]", hex::encode(&raw))
        );
    }

    #[test]
    fn test_scalar_value() {
        let raw = variable_frame(0x04, &[0xE8, 0x03]);
        let text = decoder().render(&raw);
        assert!(text.starts_with("[SYS][VOLT][mv=0x3e8]"));
    }

    #[test]
    fn test_unknown_entry_degrades_to_raw() {
        let raw = [0xC7, MARKER_FIXED, 0xFC, 0x00, 0x00];
        let text = decoder().render(&raw);
        assert_eq!(text, "[raw_data:c7d8fc0000]");
        assert_eq!(DiagDecoder::default().render(&raw), text);
    }

    #[test]
    fn test_parse_sub_formats() {
        let dec = decoder();
        let fixed = [0xC7, MARKER_FIXED, 0x04, 0x03, 0x00, 0xAA];
        match dec.parse_frame(&fixed) {
            Parse::Frame(frame) => assert_eq!(frame.length, 5),
            _ => panic!("expected fixed frame"),
        }

        let variable = variable_frame(0x03, &[0x00]);
        match dec.parse_frame(&variable) {
            Parse::Frame(frame) => {
                assert_eq!(frame.length, variable.len());
                assert_eq!(frame.kind, FrameKind::Log);
            }
            _ => panic!("expected variable frame"),
        }

        assert!(matches!(dec.parse_frame(&variable[..6]), Parse::Incomplete));
        assert!(matches!(dec.parse_frame(&[0xC7, 0x00, 0, 0, 0]), Parse::Invalid));
    }
}
