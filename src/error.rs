//! # Error Types
//!
//! Custom error types for Suspension Tuner using `thiserror`.
//!
//! [`DeviceError`] covers everything that can go wrong talking to the
//! device. It is `Clone` so a single coalesced sensor read can hand the same
//! failure to every waiting caller. [`TunerError`] is the crate-level error.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the device transport (HTTP or stream).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    /// The device did not answer within the request timeout
    #[error("request to {path} timed out after {timeout:?}")]
    TransportTimeout { path: String, timeout: Duration },

    /// The device could not be reached or answered with an error status
    #[error("device unreachable: {0}")]
    TransportUnreachable(String),

    /// A frame or response body could not be decoded
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    /// No device address is configured
    #[error("device address is missing")]
    DeviceAddressMissing,

    /// The device refused a parameter write
    #[error("actuation rejected: {0}")]
    ActuationRejected(String),
}

impl DeviceError {
    /// Returns true when repeating the same request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::TransportTimeout { .. } | DeviceError::TransportUnreachable(_)
        )
    }
}

/// Main error type for Suspension Tuner
#[derive(Debug, Error)]
pub enum TunerError {
    /// Device transport errors
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Auto-level ran out of iterations before the rig was level
    #[error("rig is too far out of level to auto-correct ({iterations} iterations)")]
    ConvergenceExhausted { iterations: u32 },

    /// A leveling or calibration session is already running
    #[error("a leveling or calibration session is already active")]
    SessionActive,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Suspension Tuner
pub type Result<T> = std::result::Result<T, TunerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = DeviceError::TransportTimeout {
            path: "/api/sensors".to_string(),
            timeout: Duration::from_millis(1500),
        };
        assert!(timeout.is_retryable());
        assert!(DeviceError::TransportUnreachable("refused".into()).is_retryable());

        assert!(!DeviceError::ProtocolDecode("bad".into()).is_retryable());
        assert!(!DeviceError::DeviceAddressMissing.is_retryable());
        assert!(!DeviceError::ActuationRejected("400".into()).is_retryable());
    }

    #[test]
    fn test_device_error_converts_into_tuner_error() {
        let err: TunerError = DeviceError::DeviceAddressMissing.into();
        assert!(matches!(err, TunerError::Device(DeviceError::DeviceAddressMissing)));
        assert_eq!(err.to_string(), "device address is missing");
    }

    #[test]
    fn test_convergence_message_mentions_out_of_level() {
        let err = TunerError::ConvergenceExhausted { iterations: 15 };
        assert!(err.to_string().contains("too far out of level"));
    }
}
