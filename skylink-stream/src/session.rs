//! Stream session state machine
//!
//! A [`StreamSession`] wraps a [`NativeStream`] and turns its asynchronous
//! events into a strict `Closed → Opening → Open → Closing → Closed`
//! lifecycle reported to a [`StreamListener`]. Sessions are not thread-safe
//! and are meant to be driven from a single event loop.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::SinkConfig;
use crate::error::{Result, StreamError};
use crate::sink::{Sink, SinkListener};
use crate::types::{CloseReason, Frame, MediaInfo, PlaybackState, StreamState};

/// Native side of a stream (transport, demuxer, decoder)
///
/// Methods only issue requests; outcomes come back as [`NativeStreamEvent`]s
/// fed to [`StreamSession::handle_event`].
pub trait NativeStream: Send {
    /// Start opening the stream
    fn open(&mut self) -> Result<()>;

    /// Start closing the stream
    fn close(&mut self, reason: CloseReason);

    fn play(&mut self);

    fn pause(&mut self);

    fn seek_to(&mut self, position_ms: i64);
}

/// Observer of stream lifecycle and media events
pub trait StreamListener: Send {
    fn stream_did_open(&mut self) {}

    fn stream_did_closing(&mut self, _reason: CloseReason) {}

    fn stream_did_close(&mut self, _reason: CloseReason) {}

    fn playback_state_did_change(&mut self, _state: &PlaybackState) {}

    fn media_added(&mut self, _media: &MediaInfo) {}

    fn media_removed(&mut self, _media: &MediaInfo) {}
}

/// Events reported by the native stream
#[derive(Debug, Clone, PartialEq)]
pub enum NativeStreamEvent {
    /// The stream is ready
    Opened,
    /// The stream started closing on its own (interruption)
    Closing(CloseReason),
    /// The stream is fully closed
    Closed(CloseReason),
    /// Playback state update
    PlaybackState(PlaybackState),
    /// A media became available
    MediaAdded(MediaInfo),
    /// A media is no longer available
    MediaRemoved(u32),
    /// A frame for one of the stream's media
    Frame(Frame),
}

/// Stream lifecycle driven by local requests and native events
pub struct StreamSession {
    name: String,
    state: StreamState,
    close_reason: CloseReason,
    native: Box<dyn NativeStream>,
    listener: Box<dyn StreamListener>,
    media: BTreeMap<u32, MediaInfo>,
    playback: Option<PlaybackState>,
    sinks: Vec<Sink>,
}

impl StreamSession {
    /// Create a closed session
    pub fn new(
        name: impl Into<String>,
        native: Box<dyn NativeStream>,
        listener: Box<dyn StreamListener>,
    ) -> Self {
        Self {
            name: name.into(),
            state: StreamState::Closed,
            close_reason: CloseReason::None,
            native,
            listener,
            media: BTreeMap::new(),
            playback: None,
            sinks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Reason of the current or last close, `None` if never closed
    pub fn close_reason(&self) -> CloseReason {
        self.close_reason
    }

    /// Last playback state reported while open
    pub fn playback(&self) -> Option<&PlaybackState> {
        self.playback.as_ref()
    }

    /// Media currently available, ordered by id
    pub fn media(&self) -> impl Iterator<Item = &MediaInfo> {
        self.media.values()
    }

    /// Number of sinks still attached
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Open the stream
    ///
    /// Returns `false` when the stream is not closed or the native open
    /// request failed.
    pub fn open(&mut self) -> bool {
        if self.state != StreamState::Closed {
            tracing::debug!("Ignoring open on stream '{}' ({})", self.name, self.state);
            return false;
        }

        self.state = StreamState::Opening;
        self.close_reason = CloseReason::None;
        if let Err(e) = self.native.open() {
            tracing::warn!("Failed to open stream '{}': {}", self.name, e);
            self.state = StreamState::Closed;
            return false;
        }
        tracing::debug!("Stream '{}' opening", self.name);
        true
    }

    /// Request the stream to close
    ///
    /// Emits `stream_did_closing(reason)` immediately; `stream_did_close`
    /// follows when the native stream reports it is closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if !matches!(self.state, StreamState::Opening | StreamState::Open) {
            tracing::debug!("Ignoring close on stream '{}' ({})", self.name, self.state);
            return false;
        }

        self.enter_closing(reason);
        self.native.close(reason);
        true
    }

    /// Close immediately without waiting for the native stream
    ///
    /// Used when the owning device goes away and no further native events
    /// will arrive.
    pub fn terminate(&mut self, reason: CloseReason) {
        match self.state {
            StreamState::Closed => return,
            StreamState::Opening | StreamState::Open => {
                self.enter_closing(reason);
                self.native.close(reason);
            }
            StreamState::Closing => {}
        }
        self.finish_close(reason);
    }

    pub fn play(&mut self) -> bool {
        if !self.is_open("play") {
            return false;
        }
        self.native.play();
        true
    }

    pub fn pause(&mut self) -> bool {
        if !self.is_open("pause") {
            return false;
        }
        self.native.pause();
        true
    }

    pub fn seek_to(&mut self, position_ms: i64) -> bool {
        if !self.is_open("seek") {
            return false;
        }
        self.native.seek_to(position_ms);
        true
    }

    /// Start a sink receiving the frames of `media_id`
    ///
    /// The stream must be open and the media available. The returned handle
    /// can be used to stop or resynchronize the sink; the session stops it
    /// when the media is removed or the stream closes.
    pub fn start_sink<L: SinkListener>(
        &mut self,
        media_id: u32,
        config: SinkConfig,
        listener: L,
    ) -> Result<Sink> {
        if self.state != StreamState::Open {
            return Err(StreamError::InvalidState {
                operation: "start sink",
                state: self.state,
            });
        }
        if !self.media.contains_key(&media_id) {
            return Err(StreamError::UnknownMedia(media_id));
        }

        let sink = Sink::new(media_id, config)?;
        sink.start(listener)?;
        self.sinks.push(sink.clone());
        tracing::debug!("Sink started on stream '{}' for media {}", self.name, media_id);
        Ok(sink)
    }

    /// Apply an event reported by the native stream
    pub fn handle_event(&mut self, event: NativeStreamEvent) {
        match event {
            NativeStreamEvent::Opened => {
                if self.state != StreamState::Opening {
                    tracing::debug!("Stream '{}' opened while {}", self.name, self.state);
                    return;
                }
                self.state = StreamState::Open;
                tracing::info!("Stream '{}' open", self.name);
                self.listener.stream_did_open();
            }
            NativeStreamEvent::Closing(reason) => {
                if matches!(self.state, StreamState::Opening | StreamState::Open) {
                    self.enter_closing(reason);
                }
            }
            NativeStreamEvent::Closed(reason) => {
                if self.state == StreamState::Closed {
                    return;
                }
                if self.state != StreamState::Closing {
                    self.enter_closing(reason);
                }
                self.finish_close(reason);
            }
            NativeStreamEvent::PlaybackState(playback) => {
                if self.state != StreamState::Open {
                    return;
                }
                self.playback = Some(playback);
                self.listener.playback_state_did_change(&playback);
            }
            NativeStreamEvent::MediaAdded(media) => {
                if self.state != StreamState::Open {
                    return;
                }
                self.listener.media_added(&media);
                self.media.insert(media.id, media);
            }
            NativeStreamEvent::MediaRemoved(media_id) => {
                let Some(media) = self.media.remove(&media_id) else {
                    return;
                };
                self.stop_sinks(|sink| sink.media_id() == media_id);
                self.listener.media_removed(&media);
            }
            NativeStreamEvent::Frame(frame) => {
                if self.state != StreamState::Open {
                    return;
                }
                self.sinks.retain(Sink::is_active);
                for sink in &self.sinks {
                    if sink.media_id() == frame.media_id && sink.format() == frame.format {
                        sink.push(frame.clone());
                    }
                }
            }
        }
    }

    fn is_open(&self, operation: &str) -> bool {
        if self.state == StreamState::Open {
            return true;
        }
        tracing::debug!("Ignoring {} on stream '{}' ({})", operation, self.name, self.state);
        false
    }

    fn enter_closing(&mut self, reason: CloseReason) {
        self.state = StreamState::Closing;
        self.close_reason = reason;
        self.stop_sinks(|_| true);
        tracing::debug!("Stream '{}' closing ({:?})", self.name, reason);
        self.listener.stream_did_closing(reason);
    }

    fn finish_close(&mut self, native_reason: CloseReason) {
        let reason = if self.close_reason == CloseReason::None {
            native_reason
        } else {
            self.close_reason
        };
        self.state = StreamState::Closed;
        self.close_reason = reason;
        self.playback = None;
        for media in std::mem::take(&mut self.media).into_values() {
            self.listener.media_removed(&media);
        }
        tracing::info!("Stream '{}' closed ({:?})", self.name, reason);
        self.listener.stream_did_close(reason);
    }

    fn stop_sinks(&mut self, mut filter: impl FnMut(&Sink) -> bool) {
        self.sinks.retain(|sink| {
            if filter(sink) {
                sink.stop();
                false
            } else {
                true
            }
        });
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop_sinks(|_| true);
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("close_reason", &self.close_reason)
            .field("media", &self.media.len())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
