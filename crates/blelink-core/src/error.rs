//! Error types for blelink-core.
//!
//! This module defines all error types that can occur while discovering,
//! connecting to and sampling BLE peripherals.
//!
//! # Error Kinds
//!
//! Every [`Error`] maps onto one of four machine-readable [`ErrorKind`]s so
//! callers can branch without matching on message strings:
//!
//! | Kind | Variants | Caller sees |
//! |------|----------|-------------|
//! | [`ErrorKind::NotFound`] | [`Error::DeviceNotFound`], [`Error::CharacteristicNotFound`] | structured "not found" outcome |
//! | [`ErrorKind::ConnectFailure`] | [`Error::ConnectionFailed`], [`Error::NotConnected`], [`Error::Timeout`], [`Error::Bluetooth`] | per-candidate failure, aggregated by the orchestrator |
//! | [`ErrorKind::DecodeError`] | [`Error::InvalidReadingFormat`] | fatal for that single read |
//! | [`ErrorKind::SessionError`] | everything else | ends one streaming session |
//!
//! # Propagation
//!
//! Registry operations clean up before returning an error, so an `Err` never
//! implies a half-registered device. The orchestrator turns per-candidate
//! errors into `"address: Label: message"` strings (see [`Error::label`]) and
//! keeps going; the streaming loop reports its terminal error once and stops.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when talking to BLE peripherals.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device not found during scan, or not tracked by the registry.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// The device is tracked but has no live connection.
    #[error("Not connected to device {address}")]
    NotConnected {
        /// The device address.
        address: String,
    },

    /// Required BLE characteristic not found on device.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Payload did not match the fixed wire format.
    #[error("Invalid reading format: expected {expected} bytes, got {actual}")]
    InvalidReadingFormat {
        /// Expected data size.
        expected: usize,
        /// Actual data size received.
        actual: usize,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Connection failed with specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// Invalid configuration or caller-supplied parameter.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A streaming session could not continue.
    #[error("Session error: {0}")]
    Session(String),
}

/// Machine-readable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No matching device, or no tracked connection for an address.
    NotFound,
    /// The device was found but could not be (or is no longer) reached.
    ConnectFailure,
    /// A payload was not the expected byte length.
    DecodeError,
    /// Any other failure; ends the current streaming session.
    SessionError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::ConnectFailure => write!(f, "connect_failure"),
            Self::DecodeError => write!(f, "decode_error"),
            Self::SessionError => write!(f, "session_error"),
        }
    }
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Device is out of range.
    OutOfRange,
    /// The connect call returned but the link is not up.
    NotLive,
    /// Generic BLE error.
    BleError(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::OutOfRange => write!(f, "device out of range"),
            Self::NotLive => write!(f, "connect returned but device is not connected"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
        }
    }
}

/// Reason why a device was not found.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// No Bluetooth adapter available.
    NoAdapter,
    /// Device with specified name/address not seen by the radio.
    NotFound { identifier: String },
    /// The registry holds no entry for the address.
    NotTracked { address: String },
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::NotTracked { address } => {
                write!(f, "no persistent connection for '{}'", address)
            }
        }
    }
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create an error for an address the registry does not track.
    pub fn not_tracked(address: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotTracked {
            address: address.into(),
        })
    }

    /// Create a not connected error for an address.
    pub fn not_connected(address: impl Into<String>) -> Self {
        Self::NotConnected {
            address: address.into(),
        }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create an invalid reading format error.
    pub fn invalid_reading(expected: usize, actual: usize) -> Self {
        Self::InvalidReadingFormat { expected, actual }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a session error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound(_) | Self::CharacteristicNotFound { .. } => ErrorKind::NotFound,
            Self::ConnectionFailed { .. }
            | Self::NotConnected { .. }
            | Self::Timeout { .. }
            | Self::Bluetooth(_) => ErrorKind::ConnectFailure,
            Self::InvalidReadingFormat { .. } => ErrorKind::DecodeError,
            Self::InvalidConfig(_) | Self::Session(_) => ErrorKind::SessionError,
        }
    }

    /// Short, stable name of the variant, used in per-candidate error strings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Bluetooth(_) => "Bluetooth",
            Self::DeviceNotFound(_) => "DeviceNotFound",
            Self::NotConnected { .. } => "NotConnected",
            Self::CharacteristicNotFound { .. } => "CharacteristicNotFound",
            Self::InvalidReadingFormat { .. } => "InvalidReadingFormat",
            Self::Timeout { .. } => "Timeout",
            Self::ConnectionFailed { .. } => "ConnectionFailed",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::Session(_) => "Session",
        }
    }
}

impl From<blelink_types::ParseError> for Error {
    fn from(err: blelink_types::ParseError) -> Self {
        match err {
            blelink_types::ParseError::InvalidLength { expected, actual } => {
                Error::InvalidReadingFormat { expected, actual }
            }
            blelink_types::ParseError::InvalidCharacteristic(input) => {
                Error::InvalidConfig(format!("invalid characteristic '{}'", input))
            }
            // Handle future ParseError variants (non_exhaustive)
            _ => Error::Session(format!("Parse error: {}", err)),
        }
    }
}

/// Result type alias using blelink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
