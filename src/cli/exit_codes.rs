//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use std::process::ExitCode;

use crate::config::ConfigError;
use crate::core::device::{CatalogError, DeviceError};
use crate::core::protocol::DiagTableError;
use crate::core::scheduler::SchedulerError;
use crate::core::simulator::SimulatorError;
use crate::core::transport::TransportError;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// No response before the timeout
    pub const TIMEOUT: u8 = 4;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Protocol error
    pub const PROTOCOL_ERROR: u8 = 9;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Device busy (a run is active)
    pub const DEVICE_BUSY: u8 = 13;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Unknown operation
    pub const OPERATION_NOT_FOUND: u8 = 18;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::TIMEOUT, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) => Some(msg),
            Self::Error(_, msg) => Some(msg),
            _ => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Map an error chain to the most specific exit code
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let msg = format!("{:#}", err);
        for cause in err.chain() {
            let code = if let Some(e) = cause.downcast_ref::<TransportError>() {
                Some(transport_code(e))
            } else if let Some(e) = cause.downcast_ref::<DeviceError>() {
                Some(match e {
                    DeviceError::OperationNotFound(_) => ExitCodes::OPERATION_NOT_FOUND,
                    DeviceError::NameConflict { .. } => ExitCodes::CONFIG_ERROR,
                    DeviceError::DeviceNotResponding(_) => ExitCodes::DEVICE_NOT_FOUND,
                    DeviceError::Encode(_) => ExitCodes::INVALID_ARGS,
                    DeviceError::Transport(e) => transport_code(e),
                })
            } else if cause.is::<ConfigError>()
                || cause.is::<CatalogError>()
                || cause.is::<DiagTableError>()
                || cause.is::<SimulatorError>()
            {
                Some(ExitCodes::CONFIG_ERROR)
            } else if let Some(e) = cause.downcast_ref::<SchedulerError>() {
                Some(match e {
                    SchedulerError::RunAlreadyActive => ExitCodes::DEVICE_BUSY,
                    SchedulerError::Transport(e) => transport_code(e),
                    SchedulerError::Io(_) => ExitCodes::ERROR,
                })
            } else {
                cause.downcast_ref::<std::io::Error>().map(io_code)
            };
            if let Some(code) = code {
                return Self::Error(code, msg);
            }
        }
        Self::Error(ExitCodes::ERROR, msg)
    }
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::ConnectionFailed(_) => ExitCodes::CONNECTION_FAILED,
        TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
        TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
        TransportError::IoError(e) => io_code(e),
        TransportError::Closed(_) => ExitCodes::CONNECTION_FAILED,
    }
}

fn io_code(err: &std::io::Error) -> u8 {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
        ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
        ErrorKind::ConnectionRefused => ExitCodes::CONNECTION_FAILED,
        ErrorKind::TimedOut => ExitCodes::TIMEOUT,
        _ => ExitCodes::ERROR,
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        Self::Error(io_code(&err), err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "No response before timeout",
        6 => "File not found",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        12 => "Device not found",
        13 => "Device busy",
        14 => "Port not found",
        18 => "Operation not found",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 6, 7, 8, 9, 11, 12, 13, 14, 18, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let result = CliResult::from(err);
        assert_eq!(result.code(), ExitCodes::FILE_NOT_FOUND);
    }

    #[test]
    fn test_error_chain_mapping() {
        let err = anyhow::Error::new(DeviceError::OperationNotFound("adv_strat".into())).context("call failed");
        assert_eq!(CliResult::from_anyhow(&err).code(), ExitCodes::OPERATION_NOT_FOUND);

        let err = anyhow::Error::new(DeviceError::Transport(TransportError::PortNotFound("/dev/ttyX".into())));
        assert_eq!(CliResult::from_anyhow(&err).code(), ExitCodes::PORT_NOT_FOUND);

        let err = anyhow::Error::new(SchedulerError::RunAlreadyActive);
        assert_eq!(CliResult::from_anyhow(&err).code(), ExitCodes::DEVICE_BUSY);

        let err = anyhow::anyhow!("something else");
        assert_eq!(CliResult::from_anyhow(&err).code(), ExitCodes::ERROR);
    }
}
