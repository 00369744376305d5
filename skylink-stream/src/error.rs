//! Error types for the skylink-stream crate.

use crate::types::StreamState;

/// Errors that can occur while driving a stream or its sinks.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The operation is not valid in the current stream state
    #[error("Cannot {operation} while stream is {state}")]
    InvalidState {
        /// The operation that was attempted
        operation: &'static str,
        /// The state the stream was in
        state: StreamState,
    },

    /// The requested media is not part of the stream
    #[error("Unknown media id: {0}")]
    UnknownMedia(u32),

    /// The native stream reported a failure
    #[error("Native stream error: {0}")]
    Native(String),

    /// The sink was already started or stopped
    #[error("Sink already {0}")]
    SinkStopped(&'static str),

    /// The sink delivery thread could not be spawned
    #[error("Failed to spawn sink delivery thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Invalid sink configuration
    #[error("Invalid sink configuration: {0}")]
    Config(String),
}

/// Convenience type alias for Results using StreamError.
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_display() {
        let error = StreamError::InvalidState {
            operation: "start sink",
            state: StreamState::Opening,
        };
        assert_eq!(error.to_string(), "Cannot start sink while stream is opening");

        let error = StreamError::UnknownMedia(7);
        assert_eq!(error.to_string(), "Unknown media id: 7");

        let error = StreamError::Native("decoder unavailable".to_string());
        assert!(error.to_string().contains("decoder unavailable"));

        let error = StreamError::SinkStopped("stopped");
        assert_eq!(error.to_string(), "Sink already stopped");
    }
}
