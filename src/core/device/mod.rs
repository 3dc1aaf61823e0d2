//! Devices
//!
//! A [`Device`] binds a [`Transport`] to a [`CapabilityRegistry`] and
//! exposes named remote operations through [`Device::call`]. On connect it
//! issues the reserved device-info call; ports that stay silent are not
//! devices and are dropped.

pub mod catalog;
pub mod operation;
pub mod registry;
pub mod search;

pub use catalog::{CatalogError, DecoderSpec, EncoderSpec, OperationCatalog, OperationSpec};
pub use operation::{Args, EncodeFn, Operation, Param, ParamKind, Uplink};
pub use registry::{CapabilityRegistry, SearchHit, DEVICE_INFO_OPERATION};

use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::protocol::{encode_frame, Decoded};
use crate::core::transport::{Expect, MatchMode, Reply, Transport, TransportError};

/// Default response timeout of a call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);
/// Timeout of the bootstrap device-info call
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Device error types
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No operation under that name or alias
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Name or alias already registered
    #[error("Name '{name}' conflicts with operation '{existing}'")]
    NameConflict {
        /// Clashing name
        name: String,
        /// Operation already holding it
        existing: String,
    },

    /// Bootstrap call got no answer
    #[error("Device on {0} not responding")]
    DeviceNotResponding(String),

    /// Arguments could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Calls go through
    Open,
    /// Both flow-control axes paused
    Paused,
    /// Transport closed
    Closed,
}

/// Per-call options
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Response timeout; the device default when `None`
    pub timeout: Option<Duration>,
    /// Frame collection mode
    pub mode: MatchMode,
}

impl CallOptions {
    /// Set the timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the collection mode
    #[must_use]
    pub fn mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Collection mode from a frame count (`-1` collects until the timeout)
    #[must_use]
    pub fn num(self, num: i32) -> Self {
        self.mode(MatchMode::from_num(num))
    }
}

/// A connected device
pub struct Device {
    name: RwLock<Option<String>>,
    transport: Transport,
    registry: CapabilityRegistry,
    info: RwLock<Option<Decoded>>,
    state: RwLock<DeviceState>,
    call_timeout: Duration,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("port", &self.port())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("operations", &self.registry.len())
            .finish()
    }
}

impl Device {
    /// Wrap a transport; the registry's decoders are bound to it
    pub fn new(transport: Transport, mut registry: CapabilityRegistry) -> Self {
        registry.ensure_builtins();
        for (header, decode, authoritative) in registry.decoders() {
            if authoritative {
                transport.bind_decoder(header, decode.clone());
            } else {
                transport.bind_decoder_if_absent(header, decode.clone());
            }
        }
        Self {
            name: RwLock::new(None),
            transport,
            registry,
            info: RwLock::new(None),
            state: RwLock::new(DeviceState::Open),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Wrap a transport and run the bootstrap handshake
    ///
    /// A silent port is closed and reported as
    /// [`DeviceError::DeviceNotResponding`].
    pub async fn connect(
        transport: Transport,
        registry: CapabilityRegistry,
        bootstrap_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let device = Self::new(transport, registry);
        match device.bootstrap(bootstrap_timeout).await {
            Ok(_) => Ok(device),
            Err(e) => {
                device.close().await;
                Err(e)
            }
        }
    }

    /// Set the default call timeout
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Port the device was opened on
    pub fn port(&self) -> &str {
        self.transport.name()
    }

    /// Display name
    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    /// Set the display name
    pub fn set_name(&self, name: &str) {
        *self.name.write() = Some(name.to_string());
    }

    /// `[port]` or `[port][name]`, for log lines
    pub fn label(&self) -> String {
        match self.name() {
            Some(name) => format!("[{}][{}]", self.port(), name),
            None => format!("[{}]", self.port()),
        }
    }

    /// Device info from the bootstrap handshake
    pub fn info(&self) -> Option<Decoded> {
        self.info.read().clone()
    }

    /// Lifecycle state
    pub fn state(&self) -> DeviceState {
        *self.state.read()
    }

    /// Capability table
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Underlying channel
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Issue the reserved device-info call and cache its answer
    pub async fn bootstrap(&self, timeout: Duration) -> Result<Decoded, DeviceError> {
        let reply = self
            .call(DEVICE_INFO_OPERATION, &Args::Null, CallOptions::default().timeout(timeout))
            .await?;
        match reply.into_single() {
            Some(info) => {
                tracing::info!(port = %self.port(), info = %info, "Device identified");
                *self.info.write() = Some(info.clone());
                Ok(info)
            }
            None => {
                tracing::debug!(port = %self.port(), "No device-info response");
                Err(DeviceError::DeviceNotResponding(self.port().to_string()))
            }
        }
    }

    /// Invoke a named operation
    ///
    /// Operations whose encoder yields no payload send nothing and only wait
    /// for their uplink headers.
    pub async fn call(&self, name: &str, args: &Args, options: CallOptions) -> Result<Reply, DeviceError> {
        let operation = self.registry.get(name)?;
        let config = self.registry.config();

        let frame = operation
            .encode(args)?
            .map(|payload| encode_frame(config, &operation.downlink_header(config), &payload));
        let expect = Expect::from_headers(
            operation
                .uplink_headers(config)
                .into_iter()
                .map(Bytes::from)
                .collect(),
        );
        let timeout = options.timeout.unwrap_or(self.call_timeout);

        tracing::debug!(device = %self.label(), operation = %operation.name, "Call");
        let reply = self
            .transport
            .call(frame.as_deref(), expect, options.mode, timeout)
            .await?;
        if reply.is_absent() {
            tracing::debug!(device = %self.label(), operation = %operation.name, "No response before timeout");
        }
        Ok(reply)
    }

    /// Collect every frame answering the listed operations until `timeout`
    pub async fn receive_indication(&self, names: &[&str], timeout: Duration) -> Result<Vec<Decoded>, DeviceError> {
        let config = self.registry.config();
        let mut headers = Vec::new();
        for name in names {
            let operation = self.registry.get(name)?;
            headers.extend(operation.uplink_headers(config).into_iter().map(Bytes::from));
        }
        let reply = self
            .transport
            .call(None, Expect::Many(headers), MatchMode::Unbounded, timeout)
            .await?;
        Ok(match reply {
            Reply::Collected(values) => values,
            other => other.into_single().into_iter().collect(),
        })
    }

    /// Fuzzy search over operation names
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        self.registry.search(query)
    }

    /// Take the rolling diagnostic buffer
    pub fn drain_diag_log(&self) -> String {
        self.transport.drain_diag_log()
    }

    /// Discard undelivered frames
    pub async fn clear(&self) {
        self.transport.clear_queue().await;
    }

    /// Pause reading and writing
    pub fn pause(&self) {
        let mut state = self.state.write();
        if *state == DeviceState::Open {
            self.transport.pause();
            *state = DeviceState::Paused;
        }
    }

    /// Resume reading and writing
    pub fn resume(&self) {
        let mut state = self.state.write();
        if *state == DeviceState::Paused {
            self.transport.resume();
            *state = DeviceState::Open;
        }
    }

    /// Close the transport
    pub async fn close(&self) {
        *self.state.write() = DeviceState::Closed;
        self.transport.close().await;
    }
}

/// Ordered collection of devices a test set runs against
#[derive(Debug, Clone, Default)]
pub struct DeviceGroup {
    devices: Arc<Vec<Arc<Device>>>,
}

impl DeviceGroup {
    /// Group over `devices`, in order
    pub fn new(devices: Vec<Arc<Device>>) -> Self {
        Self {
            devices: Arc::new(devices),
        }
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the group is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device at `index`
    pub fn get(&self, index: usize) -> Option<&Arc<Device>> {
        self.devices.get(index)
    }

    /// Iterate in order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.iter()
    }

    /// Call `name` on every device concurrently; results in device order
    pub async fn call_all(&self, name: &str, args: &Args, options: CallOptions) -> Vec<Result<Reply, DeviceError>> {
        futures::future::join_all(self.devices.iter().map(|d| d.call(name, args, options))).await
    }

    /// Pause every device
    pub fn pause(&self) {
        self.devices.iter().for_each(|d| d.pause());
    }

    /// Resume every device
    pub fn resume(&self) {
        self.devices.iter().for_each(|d| d.resume());
    }

    /// Close every device
    pub async fn close(&self) {
        futures::future::join_all(self.devices.iter().map(|d| d.close())).await;
    }
}

impl std::ops::Index<usize> for DeviceGroup {
    type Output = Device;

    fn index(&self, index: usize) -> &Device {
        &self.devices[index]
    }
}
