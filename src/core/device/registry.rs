//! Capability registry
//!
//! Maps operation names (and aliases) to definitions, and keeps the uplink
//! decode table that the transport consults for every received frame.

use std::collections::HashMap;
use std::sync::Arc;

use super::operation::{EncodeFn, Operation, Param};
use super::search::fuzzy_find;
use super::DeviceError;
use crate::core::protocol::value::raw_decoder;
use crate::core::protocol::{DecodeFn, ProtocolConfig};

/// Name of the reserved bootstrap operation
pub const DEVICE_INFO_OPERATION: &str = "device_information_get";

/// Introspection record returned by [`CapabilityRegistry::search`]
#[derive(Clone)]
pub struct SearchHit {
    /// Registered name (or alias) that matched
    pub name: String,
    /// Argument signature
    pub params: Vec<Param>,
    /// Description
    pub doc: String,
    /// Encode function, for building payloads without calling
    pub encode: EncodeFn,
}

impl std::fmt::Debug for SearchHit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchHit")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("doc", &self.doc)
            .finish_non_exhaustive()
    }
}

/// Operations of one device
#[derive(Clone)]
pub struct CapabilityRegistry {
    config: Arc<ProtocolConfig>,
    operations: HashMap<String, Arc<Operation>>,
    decoders: Vec<(Vec<u8>, DecodeFn, bool)>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("operations", &self.len())
            .field("decoders", &self.decoders.len())
            .finish()
    }
}

impl CapabilityRegistry {
    /// Empty registry
    pub fn new(config: Arc<ProtocolConfig>) -> Self {
        Self {
            config,
            operations: HashMap::new(),
            decoders: Vec::new(),
        }
    }

    /// Registry holding the reserved bootstrap operation
    pub fn with_builtins(config: Arc<ProtocolConfig>) -> Self {
        let mut registry = Self::new(config);
        // A fresh registry has no names to conflict with
        let _ = registry.register(device_info_operation(&registry.config));
        registry
    }

    /// Protocol constants
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Register an operation
    ///
    /// With several uplink headers, every header but the last gets a raw
    /// passthrough decoder unless one is already bound; the last header is
    /// bound to the operation's decoder.
    pub fn register(&mut self, operation: Operation) -> Result<(), DeviceError> {
        let names: Vec<&str> = operation.names().collect();
        if let [name, alias] = names.as_slice() {
            if name == alias {
                return Err(DeviceError::NameConflict {
                    name: name.to_string(),
                    existing: operation.name.clone(),
                });
            }
        }
        for name in &names {
            if let Some(existing) = self.operations.get(*name) {
                return Err(DeviceError::NameConflict {
                    name: name.to_string(),
                    existing: existing.name.clone(),
                });
            }
        }

        let headers = operation.uplink_headers(&self.config);
        if let Some((last, rest)) = headers.split_last() {
            for header in rest {
                if !self.decoders.iter().any(|(h, _, _)| h == header) {
                    self.decoders.push((header.clone(), raw_decoder(), false));
                }
            }
            self.decoders.retain(|(h, _, _)| h != last);
            self.decoders.push((last.clone(), operation.decode.clone(), true));
        }

        let operation = Arc::new(operation);
        for name in operation.names() {
            self.operations.insert(name.to_string(), operation.clone());
        }
        tracing::trace!(name = %operation.name, "Operation registered");
        Ok(())
    }

    /// Register the reserved bootstrap operation unless present
    pub fn ensure_builtins(&mut self) {
        if !self.contains(DEVICE_INFO_OPERATION) {
            let _ = self.register(device_info_operation(&self.config));
        }
    }

    /// Look up an operation by name or alias
    pub fn get(&self, name: &str) -> Result<Arc<Operation>, DeviceError> {
        self.operations
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::OperationNotFound(name.to_string()))
    }

    /// Whether a name or alias is registered
    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names and aliases, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of distinct operations
    pub fn len(&self) -> usize {
        let mut seen: Vec<*const Operation> = self.operations.values().map(Arc::as_ptr).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Uplink header → decoder bindings in registration order; the flag
    /// marks authoritative bindings that replace earlier ones
    pub fn decoders(&self) -> impl Iterator<Item = (&[u8], &DecodeFn, bool)> {
        self.decoders.iter().map(|(h, d, authoritative)| (h.as_slice(), d, *authoritative))
    }

    /// Fuzzy search over registered names
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        fuzzy_find(query, self.operations.keys().map(String::as_str))
            .into_iter()
            .filter_map(|hit| {
                self.operations.get(hit.name).map(|op| SearchHit {
                    name: hit.name.to_string(),
                    params: op.params.clone(),
                    doc: op.doc.clone(),
                    encode: op.encode.clone(),
                })
            })
            .collect()
    }
}

/// Reserved bootstrap operation: empty request on model 0 opcode 0,
/// answered by the marker-less device-info frame
pub fn device_info_operation(config: &ProtocolConfig) -> Operation {
    Operation::new(DEVICE_INFO_OPERATION, &[0], &[0])
        .with_doc("Query device identity")
        .with_uplink_headers(vec![config.device_info_header()])
        .with_decoder(raw_decoder())
}
