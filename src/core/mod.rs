//! Core module containing the main functionality of Devbench
//!
//! This module provides:
//! - Wire protocol: framing, checksums, diagnostic log decoding
//! - Transport layer with flow control and exchange matching
//! - Device handles and the operation registry
//! - Traffic logger for per-set log files
//! - Test framework and scheduler
//! - Virtual device simulation

pub mod device;
pub mod logger;
pub mod protocol;
pub mod scheduler;
pub mod simulator;
pub mod testing;
pub mod transport;
