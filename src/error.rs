//! Error types and result definitions for the cozylife crate.
//! Includes conversion from standard IO/JSON/HTTP errors.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to a CozyLife device
/// or to the product catalog service.
#[derive(Error, Debug, Clone)]
pub enum CozyError {
    /// Standard IO error (network, reset, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Catalog request failed at the HTTP layer
    #[error("HTTP error: {0}")]
    Http(String),

    /// Request timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// The device did not answer INFO with a usable identity
    #[error("Handshake failed")]
    HandshakeFailed,

    /// Device is currently unreachable or not ready
    #[error("Device offline")]
    Offline,

    /// Attempted to encode a command kind the device does not accept as a request
    #[error("Invalid command kind: {0}")]
    InvalidCommand(u8),

    /// The payload received was malformed or unexpected
    #[error("Invalid payload")]
    InvalidPayload,

    /// Device ID not found in manager
    #[error("Device ID '{0}' not found")]
    DeviceNotFound(String),
}

/// A specialized Result type for CozyLife operations.
pub type Result<T> = std::result::Result<T, CozyError>;

impl From<std::io::Error> for CozyError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => CozyError::Timeout,
            std::io::ErrorKind::ConnectionRefused => CozyError::ConnectionFailed,
            _ => CozyError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CozyError {
    fn from(err: serde_json::Error) -> Self {
        CozyError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for CozyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CozyError::Timeout
        } else {
            CozyError::Http(err.to_string())
        }
    }
}

impl CozyError {
    /// Whether the error is recovered locally by reconnecting.
    ///
    /// `InvalidCommand` is the only fail-fast kind; it signals a bug in the caller.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CozyError::InvalidCommand(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_map_to_specific_variants() {
        let e: CozyError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert!(matches!(e, CozyError::Timeout));

        let e: CozyError = std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(e, CozyError::ConnectionFailed));

        let e: CozyError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(e, CozyError::Io(_)));
    }

    #[test]
    fn only_invalid_command_is_fatal() {
        assert!(CozyError::Timeout.is_transient());
        assert!(CozyError::HandshakeFailed.is_transient());
        assert!(!CozyError::InvalidCommand(10).is_transient());
    }
}
