//! Error types for the event-loop crate.

/// Errors returned when interacting with an [`EventLoop`](crate::EventLoop).
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// The loop has been shut down and no longer accepts work
    #[error("Event loop '{0}' is closed")]
    Closed(String),

    /// `post_and_wait` was called from the loop thread itself
    #[error("post_and_wait called from the loop thread of '{0}'")]
    Reentrant(String),

    /// The posted work was dropped before producing a result (it panicked
    /// or the loop shut down while it was queued)
    #[error("Work posted to '{0}' was dropped before completing")]
    WorkDropped(String),

    /// The loop thread could not be spawned
    #[error("Failed to spawn loop thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Convenience type alias for Results using LoopError.
pub type Result<T> = std::result::Result<T, LoopError>;
