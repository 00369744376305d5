//! Periodic non-acknowledged command loop
//!
//! Piloting, gimbal and zoom commands are sent without acknowledgement at a
//! fixed cadence. A [`NoAckLoop`] holds the current list of [`NoAckSlot`]s
//! and, every period, asks each slot for a fresh command and sends it.
//!
//! The list can be replaced from any thread. Going from an empty list to a
//! non-empty one starts the loop, going back to empty stops it; every other
//! replacement only swaps the list read by the next tick.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::command::{BufferType, Command};
use crate::device::DeviceHandle;
use crate::error::{BackendError, CoreError, EncodeError, Result};

/// Default cadence of a no-ack loop
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(50);

/// Kind of periodic command; a list holds at most one slot per kind
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum NoAckCommandType {
    Piloting,
    GimbalControl,
    CameraZoom,
}

/// Produces the command for one tick; `Ok(None)` skips the tick
pub type CommandFactory = Arc<dyn Fn() -> std::result::Result<Option<Command>, EncodeError> + Send + Sync>;

/// Sends one command on behalf of the loop
pub type CommandSender = Arc<dyn Fn(Command) -> std::result::Result<(), BackendError> + Send + Sync>;

/// One entry of the periodic list
#[derive(Clone)]
pub struct NoAckSlot {
    kind: NoAckCommandType,
    factory: CommandFactory,
}

impl NoAckSlot {
    pub fn new<F>(kind: NoAckCommandType, factory: F) -> Self
    where
        F: Fn() -> std::result::Result<Option<Command>, EncodeError> + Send + Sync + 'static,
    {
        Self {
            kind,
            factory: Arc::new(factory),
        }
    }

    pub fn kind(&self) -> NoAckCommandType {
        self.kind
    }
}

impl fmt::Debug for NoAckSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoAckSlot").field("kind", &self.kind).finish()
    }
}

/// Effect of replacing the list
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NoAckTransition {
    /// Empty to non-empty: the loop started
    Started,
    /// Non-empty to empty: the loop stopped
    Stopped,
    /// Non-empty to non-empty
    Replaced,
    /// Empty to empty
    Unchanged,
}

/// Counters of a no-ack loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoAckLoopStats {
    pub starts: u64,
    pub stops: u64,
    pub ticks: u64,
    pub commands_sent: u64,
    pub send_errors: u64,
    pub encode_errors: u64,
}

impl fmt::Display for NoAckLoopStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "No-Ack Loop Stats:")?;
        writeln!(f, "  Starts: {}", self.starts)?;
        writeln!(f, "  Stops: {}", self.stops)?;
        writeln!(f, "  Ticks: {}", self.ticks)?;
        writeln!(f, "  Commands sent: {}", self.commands_sent)?;
        writeln!(f, "  Send errors: {}", self.send_errors)?;
        writeln!(f, "  Encode errors: {}", self.encode_errors)?;
        Ok(())
    }
}

struct LoopState {
    slots: Vec<NoAckSlot>,
    /// Bumped on every start and stop
    generation: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Counters {
    starts: AtomicU64,
    stops: AtomicU64,
    ticks: AtomicU64,
    commands_sent: AtomicU64,
    send_errors: AtomicU64,
    encode_errors: AtomicU64,
}

struct Shared {
    handle: DeviceHandle,
    period: Duration,
    sender: CommandSender,
    state: Mutex<LoopState>,
    wake: Condvar,
    /// Generation currently running, 0 when stopped
    active: AtomicU64,
    counters: Counters,
}

/// Periodic sender of the latest no-ack command snapshot for one device
pub struct NoAckLoop {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl NoAckLoop {
    /// Create a stopped loop with its timer thread
    pub fn new(handle: DeviceHandle, period: Duration, sender: CommandSender) -> Result<Self> {
        if period.is_zero() {
            return Err(CoreError::InvalidArgument(
                "no-ack period must be greater than zero".to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            handle,
            period,
            sender,
            state: Mutex::new(LoopState {
                slots: Vec::new(),
                generation: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
            active: AtomicU64::new(0),
            counters: Counters::default(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("skylink-noack-{}", handle.raw()))
            .spawn(move || run(thread_shared))
            .map_err(CoreError::Spawn)?;

        tracing::debug!("No-ack loop created for {} (period {:?})", handle, period);
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> DeviceHandle {
        self.shared.handle
    }

    pub fn period(&self) -> Duration {
        self.shared.period
    }

    pub fn is_running(&self) -> bool {
        !self.shared.state.lock().slots.is_empty()
    }

    /// Kinds in the current list, in send order
    pub fn slot_kinds(&self) -> Vec<NoAckCommandType> {
        self.shared.state.lock().slots.iter().map(NoAckSlot::kind).collect()
    }

    /// Replace the list; callable from any thread
    ///
    /// When several slots share a kind, the last one is kept.
    pub fn set_encoder_list(&self, slots: Vec<NoAckSlot>) -> NoAckTransition {
        let slots = dedup_by_kind(slots);
        let mut state = self.shared.state.lock();
        let was_running = !state.slots.is_empty();
        let running = !slots.is_empty();
        state.slots = slots;

        let transition = match (was_running, running) {
            (false, true) => {
                state.generation += 1;
                self.shared.active.store(state.generation, Ordering::SeqCst);
                self.shared.counters.starts.fetch_add(1, Ordering::Relaxed);
                self.shared.wake.notify_all();
                NoAckTransition::Started
            }
            (true, false) => {
                state.generation += 1;
                self.shared.active.store(0, Ordering::SeqCst);
                self.shared.counters.stops.fetch_add(1, Ordering::Relaxed);
                self.shared.wake.notify_all();
                NoAckTransition::Stopped
            }
            (true, true) => NoAckTransition::Replaced,
            (false, false) => NoAckTransition::Unchanged,
        };
        drop(state);

        match transition {
            NoAckTransition::Started => tracing::debug!("No-ack loop started for {}", self.shared.handle),
            NoAckTransition::Stopped => tracing::debug!("No-ack loop stopped for {}", self.shared.handle),
            _ => {}
        }
        transition
    }

    /// Empty the list and stop; `true` if the loop was running
    pub fn reset(&self) -> bool {
        self.set_encoder_list(Vec::new()) == NoAckTransition::Stopped
    }

    pub fn stats(&self) -> NoAckLoopStats {
        let counters = &self.shared.counters;
        NoAckLoopStats {
            starts: counters.starts.load(Ordering::Relaxed),
            stops: counters.stops.load(Ordering::Relaxed),
            ticks: counters.ticks.load(Ordering::Relaxed),
            commands_sent: counters.commands_sent.load(Ordering::Relaxed),
            send_errors: counters.send_errors.load(Ordering::Relaxed),
            encode_errors: counters.encode_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for NoAckLoop {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.slots.clear();
            self.shared.active.store(0, Ordering::SeqCst);
            self.shared.wake.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
        tracing::debug!("No-ack loop for {} dropped", self.shared.handle);
    }
}

impl fmt::Debug for NoAckLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoAckLoop")
            .field("handle", &self.shared.handle)
            .field("period", &self.shared.period)
            .field("running", &self.is_running())
            .finish()
    }
}

fn dedup_by_kind(slots: Vec<NoAckSlot>) -> Vec<NoAckSlot> {
    let mut kept: Vec<NoAckSlot> = Vec::with_capacity(slots.len());
    for slot in slots.into_iter().rev() {
        if !kept.iter().any(|k| k.kind == slot.kind) {
            kept.push(slot);
        }
    }
    kept.reverse();
    kept
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        if state.slots.is_empty() {
            shared.wake.wait(&mut state);
            continue;
        }
        run_generation(&shared, &mut state);
    }
}

/// Tick at a fixed cadence until the generation changes
fn run_generation(shared: &Shared, state: &mut MutexGuard<'_, LoopState>) {
    let generation = state.generation;
    let mut next_tick = Instant::now() + shared.period;

    loop {
        if state.shutdown || state.generation != generation {
            return;
        }
        if Instant::now() < next_tick {
            shared.wake.wait_until(state, next_tick);
            continue;
        }

        let slots = state.slots.clone();
        MutexGuard::unlocked(state, || tick(shared, generation, &slots));

        next_tick += shared.period;
        let now = Instant::now();
        if next_tick <= now {
            // fell behind: skip missed ticks rather than bursting
            next_tick = now + shared.period;
        }
    }
}

fn tick(shared: &Shared, generation: u64, slots: &[NoAckSlot]) {
    shared.counters.ticks.fetch_add(1, Ordering::Relaxed);

    for slot in slots {
        if shared.active.load(Ordering::SeqCst) != generation {
            tracing::trace!("No-ack tick for {} interrupted by stop", shared.handle);
            return;
        }

        let produced = panic::catch_unwind(AssertUnwindSafe(|| (slot.factory)()));
        let mut command = match produced {
            Ok(Ok(Some(command))) => command,
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => {
                tracing::warn!("No-ack {:?} encoder failed for {}: {}", slot.kind, shared.handle, e);
                shared.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Err(_) => {
                tracing::error!("No-ack {:?} encoder panicked for {}", slot.kind, shared.handle);
                shared.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        if let Err(e) = command.validate() {
            tracing::warn!("No-ack {:?} command refused for {}: {}", slot.kind, shared.handle, e);
            shared.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        command.buffer = BufferType::NoAck;
        match (shared.sender)(command) {
            Ok(()) => {
                shared.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!("No-ack {:?} send failed for {}: {}", slot.kind, shared.handle, e);
                shared.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
