//! Error types for data parsing in blelink-types.

use thiserror::Error;

/// Errors that can occur when parsing sensor payloads or identifiers.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in blelink-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Payload length does not match the fixed wire format.
    #[error("Invalid payload length: requires {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required number of bytes.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// Characteristic identifier is neither a UUID nor a 16-bit short form.
    #[error("Invalid characteristic identifier: '{0}'")]
    InvalidCharacteristic(String),
}

/// Result type alias using blelink-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
