//! Error types for the skylink-core crate.

use crate::device::{BackendType, DeviceHandle};

/// Errors raised by a command encoder.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The payload does not fit in a single command
    #[error("Command payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Size of the rejected payload
        size: usize,
        /// Maximum accepted size
        max: usize,
    },

    /// An argument cannot be represented on the wire
    #[error("Invalid command argument: {0}")]
    InvalidArgument(String),
}

/// Errors raised while decoding raw command bytes.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than a command header
    #[error("Command too short: {0} bytes")]
    TooShort(usize),

    /// The payload exceeds the maximum size
    #[error("Command payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Errors reported by a backend controller.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend does not implement the operation
    #[error("Operation not supported by backend: {0}")]
    Unsupported(&'static str),

    /// A command could not be transmitted
    #[error("Failed to send command to {handle}: {reason}")]
    SendFailed {
        /// Target device
        handle: DeviceHandle,
        /// Transport-level reason
        reason: String,
    },

    /// A connection could not be initiated
    #[error("Failed to connect to {handle}: {reason}")]
    ConnectFailed {
        /// Target device
        handle: DeviceHandle,
        /// Transport-level reason
        reason: String,
    },

    /// I/O error from the transport
    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Other(String),
}

/// Errors that can occur in the controller.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The controller event loop is not available
    #[error("Event loop error: {0}")]
    Loop(#[from] event_loop::LoopError),

    /// A backend operation failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A command could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// A command could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A stream operation failed
    #[error("Stream error: {0}")]
    Stream(#[from] skylink_stream::StreamError),

    /// The handle does not belong to a known device
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceHandle),

    /// The operation requires a connected device
    #[error("Device {0} is not connected")]
    NotConnected(DeviceHandle),

    /// Requests were aborted by a disconnection and the device has not
    /// reconnected since
    #[error("Requests for device {0} are aborted until it reconnects")]
    RequestsAborted(DeviceHandle),

    /// The backend of the device does not provide file transfers
    #[error("No transfer support on {backend} backend for device {handle}")]
    NoTransfer {
        /// Target device
        handle: DeviceHandle,
        /// Backend owning the device
        backend: BackendType,
    },

    /// Unknown stream identifier
    #[error("Unknown stream: {0}")]
    UnknownStream(u32),

    /// Invalid argument provided by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker thread could not be spawned
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Convenience type alias for Results using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_display() {
        let error = CoreError::UnknownDevice(DeviceHandle::new(4));
        assert_eq!(error.to_string(), "Unknown device: #4");

        let error = CoreError::NotConnected(DeviceHandle::new(1));
        assert_eq!(error.to_string(), "Device #1 is not connected");

        let error = CoreError::NoTransfer {
            handle: DeviceHandle::new(2),
            backend: BackendType::Ble,
        };
        assert_eq!(
            error.to_string(),
            "No transfer support on ble backend for device #2"
        );
    }

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::SendFailed {
            handle: DeviceHandle::new(3),
            reason: "socket closed".to_string(),
        };
        assert_eq!(error.to_string(), "Failed to send command to #3: socket closed");

        let error = BackendError::Unsupported("tcp proxy");
        assert!(error.to_string().contains("tcp proxy"));
    }

    #[test]
    fn test_error_conversions() {
        let error: CoreError = EncodeError::InvalidArgument("roll".to_string()).into();
        assert!(matches!(error, CoreError::Encode(_)));

        let error: CoreError = DecodeError::TooShort(2).into();
        assert_eq!(error.to_string(), "Decode error: Command too short: 2 bytes");

        let error: CoreError = event_loop::LoopError::Closed("skylink-loop".to_string()).into();
        assert!(matches!(error, CoreError::Loop(_)));
    }
}
