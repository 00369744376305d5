//! Core types for the skylink-stream crate.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;

/// Lifecycle state of a stream session.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum StreamState {
    /// Not open; `open` may be called
    Closed,
    /// `open` was called, waiting for the native stream to become ready
    Opening,
    /// The stream is ready; playback controls and sinks are available
    Open,
    /// Close requested or interrupted, waiting for the native stream to close
    Closing,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Closed => "closed",
            StreamState::Opening => "opening",
            StreamState::Open => "open",
            StreamState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Reason a stream was closed.
///
/// The integer values are shared with the native stream peer and must not
/// change.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
#[repr(i32)]
pub enum CloseReason {
    /// Close has not been requested yet
    None = -1,
    /// Unspecified reason
    Unspecified = 0,
    /// Closed by an interruption (for example the link dropped)
    Interrupted = 1,
    /// Closed on user request
    UserRequested = 2,
    /// Closed for an internal reason (for example the device disconnected)
    Internal = 3,
}

impl CloseReason {
    /// Numeric code of the reason.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Reason matching a numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(CloseReason::None),
            0 => Some(CloseReason::Unspecified),
            1 => Some(CloseReason::Interrupted),
            2 => Some(CloseReason::UserRequested),
            3 => Some(CloseReason::Internal),
            _ => None,
        }
    }
}

/// Snapshot of the playback state reported by the native stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackState {
    /// Stream duration in milliseconds, 0 when irrelevant (live stream)
    pub duration_ms: i64,
    /// Playback position in milliseconds at `timestamp`
    pub position_ms: i64,
    /// Playback speed multiplier, 0 when paused
    pub speed: f64,
    /// Monotonic instant at which the state was collected
    pub timestamp: Instant,
}

impl PlaybackState {
    /// Create a playback state collected now.
    pub fn new(duration_ms: i64, position_ms: i64, speed: f64) -> Self {
        Self {
            duration_ms,
            position_ms,
            speed,
            timestamp: Instant::now(),
        }
    }

    /// Whether playback is paused.
    pub fn is_paused(&self) -> bool {
        self.speed == 0.0
    }

    /// Time elapsed since the state was collected.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    /// Whether the state is older than `max_age`.
    pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    /// Position extrapolated to `now` from the reported position and speed.
    ///
    /// Clamped to `[0, duration_ms]` when the duration is known.
    pub fn estimated_position_ms(&self, now: Instant) -> i64 {
        let elapsed_ms = self.age(now).as_secs_f64() * 1000.0;
        let estimate = self.position_ms + (elapsed_ms * self.speed) as i64;
        if self.duration_ms > 0 {
            estimate.clamp(0, self.duration_ms)
        } else {
            estimate.max(0)
        }
    }
}

/// Kind of media carried by a stream.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum MediaKind {
    /// Video track
    Video,
    /// Timed metadata track
    Metadata,
}

/// Description of a media announced by the native stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    /// Identifier of the media within its stream
    pub id: u32,
    /// Kind of media
    pub kind: MediaKind,
    /// Frame width in pixels, 0 when not applicable
    pub width: u32,
    /// Frame height in pixels, 0 when not applicable
    pub height: u32,
    /// Name of the source track
    pub name: String,
}

impl MediaInfo {
    /// Create a video media description.
    pub fn video(id: u32, width: u32, height: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            kind: MediaKind::Video,
            width,
            height,
            name: name.into(),
        }
    }
}

/// Encoding of frames produced for a sink.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum FrameFormat {
    /// Decoded planar YUV frames
    Yuv,
    /// H.264 elementary stream, Annex B byte stream
    H264AnnexB,
    /// H.264 elementary stream, length-prefixed (AVCC)
    H264Avcc,
}

/// A single frame travelling from the native stream to sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Media the frame belongs to
    pub media_id: u32,
    /// Encoding of `data`
    pub format: FrameFormat,
    /// Capture timestamp in microseconds
    pub timestamp_us: u64,
    /// Whether decoding can start at this frame (key frame)
    pub is_sync: bool,
    /// Frame payload
    pub data: Bytes,
}

impl Frame {
    /// Create a frame.
    pub fn new(
        media_id: u32,
        format: FrameFormat,
        timestamp_us: u64,
        is_sync: bool,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            media_id,
            format,
            timestamp_us,
            is_sync,
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::None.code(), -1);
        assert_eq!(CloseReason::Unspecified.code(), 0);
        assert_eq!(CloseReason::Interrupted.code(), 1);
        assert_eq!(CloseReason::UserRequested.code(), 2);
        assert_eq!(CloseReason::Internal.code(), 3);

        for code in -1..=3 {
            assert_eq!(CloseReason::from_code(code).map(CloseReason::code), Some(code));
        }
        assert_eq!(CloseReason::from_code(4), None);
    }

    #[test]
    fn test_playback_extrapolation() {
        let start = Instant::now();
        let state = PlaybackState {
            duration_ms: 10_000,
            position_ms: 1_000,
            speed: 2.0,
            timestamp: start,
        };

        let later = start + Duration::from_millis(500);
        assert_eq!(state.estimated_position_ms(later), 2_000);

        let much_later = start + Duration::from_secs(60);
        assert_eq!(state.estimated_position_ms(much_later), 10_000);
    }

    #[test]
    fn test_paused_playback_does_not_move() {
        let start = Instant::now();
        let state = PlaybackState {
            duration_ms: 0,
            position_ms: 4_200,
            speed: 0.0,
            timestamp: start,
        };
        assert!(state.is_paused());
        assert_eq!(state.estimated_position_ms(start + Duration::from_secs(3)), 4_200);
    }

    #[test]
    fn test_playback_staleness() {
        let start = Instant::now();
        let state = PlaybackState {
            duration_ms: 0,
            position_ms: 0,
            speed: 1.0,
            timestamp: start,
        };
        assert!(!state.is_stale(start + Duration::from_millis(100), Duration::from_secs(1)));
        assert!(state.is_stale(start + Duration::from_secs(2), Duration::from_secs(1)));
    }

    #[test]
    fn test_stream_state_display() {
        assert_eq!(StreamState::Open.to_string(), "open");
        assert_eq!(StreamState::Closing.to_string(), "closing");
    }
}
