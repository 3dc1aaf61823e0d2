//! # Devbench Core Library
//!
//! A test bench for embedded devices that speak a length+checksum framed
//! binary protocol over a serial line:
//! - Frame codec with LRC/sum checksums and configurable field widths
//! - Diagnostic log decoding from a field-description table
//! - Flow-controlled transport with request/response matching
//! - Operation registry loaded from a catalog file
//! - Test sets with PASS/FAIL/BLOCK results and pluggable result sinks
//! - Scheduler with repeat counts, pause/resume and cancellation
//! - Virtual device for running everything without hardware
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use devbench_core::core::device::{CallOptions, CapabilityRegistry, Device};
//! use devbench_core::core::logger;
//! use devbench_core::core::protocol::{FrameCodec, ProtocolConfig};
//! use devbench_core::core::transport::{SerialConfig, Transport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let protocol = Arc::new(ProtocolConfig::default());
//!     let transport = Transport::open_serial(
//!         &SerialConfig::new("/dev/ttyUSB0", 921_600),
//!         FrameCodec::new(protocol.clone()),
//!         logger::shared(),
//!     )?;
//!     let registry = CapabilityRegistry::with_builtins(protocol);
//!     let device = Device::connect(transport, registry, Duration::from_secs(1)).await?;
//!     println!("{:?}", device.info());
//!     device.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::AppConfig;
pub use crate::core::device::{CallOptions, CapabilityRegistry, Device, DeviceError, DeviceGroup};
pub use crate::core::logger::{LogFormat, TrafficLog, TrafficLogger};
pub use crate::core::protocol::{Decoded, Frame, FrameCodec, ProtocolConfig};
pub use crate::core::scheduler::{RunSummary, Scheduler, SchedulerError, SchedulerEvent, SchedulerSettings};
pub use crate::core::testing::{CaseContext, CaseResult, CaseSpec, TestRegistry, TestSet, TestSetDef, Verdict};
pub use crate::core::transport::{Reply, SerialConfig, Transport, TransportError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
