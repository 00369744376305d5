//! Configuration types for frame sinks

use crate::error::{Result, StreamError};
use crate::queue::OverflowPolicy;
use crate::types::FrameFormat;

/// Configuration of a [`Sink`](crate::Sink)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Maximum number of frames buffered before the overflow policy applies
    /// Default: 3
    pub queue_capacity: usize,

    /// Overflow behavior when the queue is full
    /// Default: DropEldest
    pub overflow_policy: OverflowPolicy,

    /// Frame encoding the sink consumes
    /// Default: Yuv
    pub frame_format: FrameFormat,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 3,
            overflow_policy: OverflowPolicy::DropEldest,
            frame_format: FrameFormat::Yuv,
        }
    }
}

impl SinkConfig {
    /// Create a SinkConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Low-latency display: a single frame, newest wins
    pub fn live_display() -> Self {
        Self {
            queue_capacity: 1,
            ..Default::default()
        }
    }

    /// Recording: a deep queue of encoded frames where nothing already
    /// buffered is discarded
    pub fn recording() -> Self {
        Self {
            queue_capacity: 64,
            overflow_policy: OverflowPolicy::DropNew,
            frame_format: FrameFormat::H264AnnexB,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(StreamError::Config(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_format(mut self, format: FrameFormat) -> Self {
        self.frame_format = format;
        self
    }
}
