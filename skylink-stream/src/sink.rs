//! Frame sink: a bounded queue drained by a dedicated delivery thread
//!
//! Frames pushed into a [`Sink`] are buffered in a [`FrameQueue`] and handed
//! to a [`SinkListener`] in arrival order once the sink is started. Frames
//! pushed before `start` stay buffered (subject to the overflow policy).
//!
//! `stop` clears the queue and waits for an in-flight `on_frame` to return;
//! once it returns no further `on_frame` is delivered. `on_stop` then follows
//! exactly once on the delivery thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::SinkConfig;
use crate::error::{Result, StreamError};
use crate::queue::{FrameQueue, PushOutcome};
use crate::types::{Frame, FrameFormat};

/// Consumer of frames delivered by a [`Sink`]
///
/// Both callbacks run on the sink's delivery thread.
pub trait SinkListener: Send + 'static {
    /// Called for each frame, in arrival order
    fn on_frame(&mut self, frame: &Frame);

    /// Called once after the sink stopped
    fn on_stop(&mut self) {}
}

/// Lifecycle phase of a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkPhase {
    /// Created, buffering frames, not delivering yet
    Idle,
    /// Delivering frames to the listener
    Running,
    /// Stop requested, `on_stop` pending
    Stopping,
    /// Terminal
    Stopped,
}

/// Delivery statistics of a sink
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub received: u64,
    pub delivered: u64,
    pub evicted: u64,
    pub dropped_new: u64,
    pub dropped_unsynced: u64,
    pub queued: usize,
}

impl fmt::Display for SinkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sink Stats:")?;
        writeln!(f, "  Received: {}", self.received)?;
        writeln!(f, "  Delivered: {}", self.delivered)?;
        writeln!(f, "  Evicted (drop eldest): {}", self.evicted)?;
        writeln!(f, "  Dropped (drop new): {}", self.dropped_new)?;
        writeln!(f, "  Dropped (awaiting sync): {}", self.dropped_unsynced)?;
        writeln!(f, "  Queued: {}", self.queued)?;
        Ok(())
    }
}

struct SinkState {
    queue: FrameQueue,
    phase: SinkPhase,
    delivering: bool,
    delivery_thread: Option<ThreadId>,
    received: u64,
    delivered: u64,
}

struct SinkShared {
    media_id: u32,
    config: SinkConfig,
    state: Mutex<SinkState>,
    frames_available: Condvar,
    delivery_idle: Condvar,
    handles: AtomicUsize,
}

/// Handle to a frame sink
///
/// Cloning yields another handle to the same sink. The sink is stopped when
/// the last handle is dropped.
pub struct Sink {
    shared: Arc<SinkShared>,
}

impl Sink {
    /// Create an idle sink for `media_id`
    pub fn new(media_id: u32, config: SinkConfig) -> Result<Self> {
        config.validate()?;
        let queue = FrameQueue::new(config.queue_capacity, config.overflow_policy);
        Ok(Self {
            shared: Arc::new(SinkShared {
                media_id,
                config,
                state: Mutex::new(SinkState {
                    queue,
                    phase: SinkPhase::Idle,
                    delivering: false,
                    delivery_thread: None,
                    received: 0,
                    delivered: 0,
                }),
                frames_available: Condvar::new(),
                delivery_idle: Condvar::new(),
                handles: AtomicUsize::new(1),
            }),
        })
    }

    pub fn media_id(&self) -> u32 {
        self.shared.media_id
    }

    pub fn config(&self) -> &SinkConfig {
        &self.shared.config
    }

    pub fn format(&self) -> FrameFormat {
        self.shared.config.frame_format
    }

    pub fn phase(&self) -> SinkPhase {
        self.shared.state.lock().phase
    }

    /// Whether the sink still accepts frames
    pub fn is_active(&self) -> bool {
        matches!(self.phase(), SinkPhase::Idle | SinkPhase::Running)
    }

    /// Start delivering frames to `listener` on a dedicated thread
    pub fn start<L: SinkListener>(&self, listener: L) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match state.phase {
                SinkPhase::Idle => state.phase = SinkPhase::Running,
                SinkPhase::Running => return Err(StreamError::SinkStopped("started")),
                SinkPhase::Stopping | SinkPhase::Stopped => {
                    return Err(StreamError::SinkStopped("stopped"))
                }
            }
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("skylink-sink-{}", self.shared.media_id))
            .spawn(move || deliver(shared, listener));

        if let Err(e) = spawned {
            let mut state = self.shared.state.lock();
            state.phase = SinkPhase::Stopped;
            state.queue.clear();
            return Err(StreamError::Spawn(e));
        }

        tracing::debug!("Sink for media {} started", self.shared.media_id);
        Ok(())
    }

    /// Offer a frame to the sink
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let mut state = self.shared.state.lock();
        if !matches!(state.phase, SinkPhase::Idle | SinkPhase::Running) {
            return PushOutcome::Rejected;
        }
        state.received += 1;
        let outcome = state.queue.push(frame);
        if outcome.is_queued() {
            self.shared.frames_available.notify_one();
        }
        if outcome != PushOutcome::Queued {
            tracing::trace!("Sink {} push outcome: {:?}", self.shared.media_id, outcome);
        }
        outcome
    }

    /// Drop buffered frames and ignore incoming ones until the next sync frame
    pub fn resynchronize(&self) {
        self.shared.state.lock().queue.resynchronize();
        tracing::debug!("Sink for media {} resynchronizing", self.shared.media_id);
    }

    /// Stop the sink
    ///
    /// Returns `false` if the sink was already stopped. When called from
    /// another thread than the delivery thread, waits for an in-flight
    /// `on_frame` to complete before returning.
    pub fn stop(&self) -> bool {
        let mut state = self.shared.state.lock();
        match state.phase {
            SinkPhase::Idle => {
                state.phase = SinkPhase::Stopped;
                state.queue.clear();
                return true;
            }
            SinkPhase::Stopping | SinkPhase::Stopped => return false,
            SinkPhase::Running => {}
        }

        state.phase = SinkPhase::Stopping;
        state.queue.clear();
        self.shared.frames_available.notify_all();

        if state.delivery_thread != Some(thread::current().id()) {
            while state.delivering {
                self.shared.delivery_idle.wait(&mut state);
            }
        }
        tracing::debug!("Sink for media {} stopped", self.shared.media_id);
        true
    }

    pub fn stats(&self) -> SinkStats {
        let state = self.shared.state.lock();
        SinkStats {
            received: state.received,
            delivered: state.delivered,
            evicted: state.queue.evicted_count(),
            dropped_new: state.queue.dropped_new_count(),
            dropped_unsynced: state.queue.dropped_unsynced_count(),
            queued: state.queue.len(),
        }
    }
}

impl Clone for Sink {
    fn clone(&self) -> Self {
        self.shared.handles.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        if self.shared.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stop();
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("media_id", &self.shared.media_id)
            .field("format", &self.shared.config.frame_format)
            .field("phase", &self.phase())
            .finish()
    }
}

fn deliver<L: SinkListener>(shared: Arc<SinkShared>, mut listener: L) {
    let mut state = shared.state.lock();
    state.delivery_thread = Some(thread::current().id());

    while state.phase == SinkPhase::Running {
        let Some(frame) = state.queue.pop() else {
            shared.frames_available.wait(&mut state);
            continue;
        };

        state.delivering = true;
        MutexGuard::unlocked(&mut state, || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_frame(&frame)));
            if outcome.is_err() {
                tracing::error!("Sink listener for media {} panicked in on_frame", shared.media_id);
            }
        });
        state.delivering = false;
        state.delivered += 1;
        shared.delivery_idle.notify_all();
    }
    drop(state);

    listener.on_stop();
    shared.state.lock().phase = SinkPhase::Stopped;
}
