//! Video stream sessions and frame sinks
//!
//! - [`StreamSession`]: `Closed → Opening → Open → Closing → Closed` state
//!   machine over a [`NativeStream`], reporting to a [`StreamListener`]
//! - [`Sink`]: bounded frame consumer with [`OverflowPolicy::DropEldest`] or
//!   [`OverflowPolicy::DropNew`] overflow handling, delivering on its own
//!   thread to a [`SinkListener`]
//!
//! ```rust
//! use skylink_stream::{Frame, FrameFormat, Sink, SinkConfig, SinkListener};
//! use std::sync::mpsc;
//!
//! struct Collect(mpsc::Sender<u64>);
//!
//! impl SinkListener for Collect {
//!     fn on_frame(&mut self, frame: &Frame) {
//!         let _ = self.0.send(frame.timestamp_us);
//!     }
//! }
//!
//! let sink = Sink::new(1, SinkConfig::new().with_capacity(3)).unwrap();
//! for ts in 1..=4 {
//!     sink.push(Frame::new(1, FrameFormat::Yuv, ts, true, vec![]));
//! }
//!
//! let (tx, rx) = mpsc::channel();
//! sink.start(Collect(tx)).unwrap();
//! let delivered: Vec<u64> = rx.iter().take(3).collect();
//! assert_eq!(delivered, vec![2, 3, 4]);
//! ```

pub mod config;
pub mod error;
pub mod queue;
pub mod session;
pub mod sink;
pub mod types;

pub use config::SinkConfig;
pub use error::{Result, StreamError};
pub use queue::{FrameQueue, OverflowPolicy, PushOutcome};
pub use session::{NativeStream, NativeStreamEvent, StreamListener, StreamSession};
pub use sink::{Sink, SinkListener, SinkPhase, SinkStats};
pub use types::{CloseReason, Frame, FrameFormat, MediaInfo, MediaKind, PlaybackState, StreamState};
