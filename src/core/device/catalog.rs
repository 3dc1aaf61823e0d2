//! Declarative operation catalogs
//!
//! A device family describes its commands in a YAML, JSON or TOML document:
//!
//! ```yaml
//! operations:
//!   - name: led_set
//!     alias: led
//!     doc: Switch the status LED
//!     model_id: "02"
//!     opcode: "10"
//!     params:
//!       - { name: enabled, type: bool }
//!     encode: fields
//!     decode: status
//! ```
//!
//! Byte fields are hex strings. Encoders: `empty`, `listen` (no frame),
//! `hex` (sends `payload`), `fields`. Decoders: `raw`, `status`, `text`, `fields`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use super::operation::{
    empty_encoder, fields_decoder, fields_encoder, hex_encoder, listen_encoder, passthrough_decoder, status_decoder,
    text_decoder, Operation, Param,
};
use super::registry::CapabilityRegistry;
use super::DeviceError;

/// Catalog loading errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// File could not be read
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        /// Catalog path
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// YAML syntax or schema error
    #[error("Invalid catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON syntax or schema error
    #[error("Invalid catalog: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML syntax or schema error
    #[error("Invalid catalog: {0}")]
    Toml(#[from] toml::de::Error),

    /// A byte field is not valid hex
    #[error("Operation '{operation}': invalid hex in {field}: '{value}'")]
    InvalidHex {
        /// Operation name
        operation: String,
        /// Field name
        field: &'static str,
        /// Offending text
        value: String,
    },

    /// Registration failed
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Payload builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderSpec {
    /// Empty payload
    #[default]
    Empty,
    /// No frame is sent; the call only listens
    Listen,
    /// Fixed payload bytes from `payload`
    Hex,
    /// Arguments packed per the parameter list
    Fields,
}

/// Response decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderSpec {
    /// Raw bytes
    Raw,
    /// Status word
    #[default]
    Status,
    /// UTF-8 text
    Text,
    /// Fields per the parameter list
    Fields,
}

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Lookup name
    pub name: String,
    /// Second lookup name
    #[serde(default)]
    pub alias: Option<String>,
    /// Description
    #[serde(default)]
    pub doc: String,
    /// Model id (hex)
    pub model_id: String,
    /// Opcode (hex)
    pub opcode: String,
    /// Alternate uplink opcode (hex)
    #[serde(default)]
    pub uplink_opcode: Option<String>,
    /// Explicit uplink headers (hex), last is authoritative
    #[serde(default)]
    pub uplink_headers: Vec<String>,
    /// Argument signature
    #[serde(default)]
    pub params: Vec<Param>,
    /// Response fields, for the `fields` decoder
    #[serde(default)]
    pub response: Vec<Param>,
    /// Payload builder
    #[serde(default)]
    pub encode: EncoderSpec,
    /// Fixed payload (hex), for the `hex` encoder
    #[serde(default)]
    pub payload: String,
    /// Response decoder
    #[serde(default)]
    pub decode: DecoderSpec,
}

impl OperationSpec {
    fn bytes(&self, field: &'static str, value: &str) -> Result<Vec<u8>, CatalogError> {
        let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        let compact = compact.trim_start_matches("0x");
        hex::decode(compact).map_err(|_| CatalogError::InvalidHex {
            operation: self.name.clone(),
            field,
            value: value.to_string(),
        })
    }

    /// Build the operation
    pub fn build(&self) -> Result<Operation, CatalogError> {
        let model_id = self.bytes("model_id", &self.model_id)?;
        let opcode = self.bytes("opcode", &self.opcode)?;

        let encode = match self.encode {
            EncoderSpec::Empty => empty_encoder(),
            EncoderSpec::Listen => listen_encoder(),
            EncoderSpec::Hex => hex_encoder(self.bytes("payload", &self.payload)?),
            EncoderSpec::Fields => fields_encoder(self.params.clone()),
        };
        let decode = match self.decode {
            DecoderSpec::Raw => passthrough_decoder(),
            DecoderSpec::Status => status_decoder(),
            DecoderSpec::Text => text_decoder(),
            DecoderSpec::Fields => fields_decoder(self.response.clone()),
        };

        let mut op = Operation::new(&self.name, &model_id, &opcode)
            .with_doc(&self.doc)
            .with_params(self.params.clone())
            .with_encoder(encode)
            .with_decoder(decode);
        if let Some(alias) = &self.alias {
            op = op.with_alias(alias);
        }
        if !self.uplink_headers.is_empty() {
            let headers = self
                .uplink_headers
                .iter()
                .map(|h| self.bytes("uplink_headers", h))
                .collect::<Result<Vec<_>, _>>()?;
            op = op.with_uplink_headers(headers);
        } else if let Some(uplink) = &self.uplink_opcode {
            op = op.with_uplink_opcode(&self.bytes("uplink_opcode", uplink)?);
        }
        Ok(op)
    }
}

/// A device family's operation catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationCatalog {
    /// Entries in registration order
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

impl OperationCatalog {
    /// Load from a `.toml`, `.json`, `.yaml` or `.yml` file
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Ok(serde_yaml::from_str(&content)?),
        }
    }

    /// Register every entry, stopping at the first conflict
    pub fn install(&self, registry: &mut CapabilityRegistry) -> Result<usize, CatalogError> {
        for spec in &self.operations {
            registry.register(spec.build()?)?;
        }
        Ok(self.operations.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{Decoded, ProtocolConfig};
    use serde_json::json;
    use std::sync::Arc;

    const CATALOG: &str = r#"
operations:
  - name: led_set
    alias: led
    doc: Switch the status LED
    model_id: "02"
    opcode: "10"
    params:
      - { name: enabled, type: bool }
    encode: fields
  - name: version_get
    model_id: "01"
    opcode: "01"
    decode: text
  - name: adv_report
    model_id: "03"
    opcode: "05"
    encode: listen
    decode: raw
  - name: ping
    model_id: "00"
    opcode: "7f"
    encode: hex
    payload: "de ad"
    uplink_headers: ["bb007e", "bb007f"]
"#;

    #[test]
    fn test_yaml_catalog() {
        let catalog: OperationCatalog = serde_yaml::from_str(CATALOG).unwrap();
        let mut reg = CapabilityRegistry::new(Arc::new(ProtocolConfig::default()));
        assert_eq!(catalog.install(&mut reg).unwrap(), 4);

        let led = reg.get("led").unwrap();
        assert_eq!(led.encode(&json!({"enabled": true})).unwrap().unwrap().as_ref(), &[0x01]);
        assert_eq!(led.doc, "Switch the status LED");

        let version = reg.get("version_get").unwrap();
        assert_eq!((version.decode)(b"1.2.0"), Decoded::Text("1.2.0".into()));

        assert_eq!(reg.get("adv_report").unwrap().encode(&json!({})).unwrap(), None);

        let ping = reg.get("ping").unwrap();
        assert_eq!(ping.encode(&json!({})).unwrap().unwrap().as_ref(), &[0xDE, 0xAD]);
        assert_eq!(
            ping.uplink_headers(reg.config()),
            vec![vec![0xBB, 0x00, 0x7E], vec![0xBB, 0x00, 0x7F]]
        );
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("family.toml");
        std::fs::write(
            &path,
            r#"
[[operations]]
name = "reset"
model_id = "00"
opcode = "02"
uplink_opcode = "03"
"#,
        )
        .unwrap();

        let catalog = OperationCatalog::load(&path).unwrap();
        let op = catalog.operations[0].build().unwrap();
        assert_eq!(op.uplink_headers(&ProtocolConfig::default()), vec![vec![0xBB, 0x00, 0x03]]);
    }

    #[test]
    fn test_bad_hex() {
        let spec = OperationSpec {
            name: "broken".into(),
            alias: None,
            doc: String::new(),
            model_id: "zz".into(),
            opcode: "01".into(),
            uplink_opcode: None,
            uplink_headers: Vec::new(),
            params: Vec::new(),
            response: Vec::new(),
            encode: EncoderSpec::Empty,
            payload: String::new(),
            decode: DecoderSpec::Status,
        };
        assert!(matches!(spec.build(), Err(CatalogError::InvalidHex { field: "model_id", .. })));
    }

    #[test]
    fn test_conflict_aborts_install() {
        let catalog: OperationCatalog = serde_yaml::from_str(
            r#"
operations:
  - { name: a, model_id: "01", opcode: "01" }
  - { name: b, alias: a, model_id: "01", opcode: "02" }
"#,
        )
        .unwrap();
        let mut reg = CapabilityRegistry::new(Arc::new(ProtocolConfig::default()));
        assert!(matches!(
            catalog.install(&mut reg),
            Err(CatalogError::Device(DeviceError::NameConflict { .. }))
        ));
    }
}
