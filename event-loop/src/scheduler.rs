//! One-shot timers owned by the loop thread
//!
//! The [`Scheduler`] is handed to every piece of posted work alongside the
//! loop state. Timers scheduled or cancelled through it take effect
//! immediately: a timer cancelled from the loop thread never fires.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::event_loop::{LoopHandle, Work};

/// Identifier of a scheduled one-shot timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw numeric value, useful for logging
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Timer queue and loop access handed to posted work
pub struct Scheduler<S> {
    handle: LoopHandle<S>,
    deadlines: BinaryHeap<Reverse<(Instant, TimerId)>>,
    pending: HashMap<TimerId, Work<S>>,
}

impl<S> Scheduler<S> {
    pub(crate) fn new(handle: LoopHandle<S>) -> Self {
        Self {
            handle,
            deadlines: BinaryHeap::new(),
            pending: HashMap::new(),
        }
    }

    /// Handle to the loop this scheduler belongs to
    pub fn handle(&self) -> &LoopHandle<S> {
        &self.handle
    }

    /// Run `work` on the loop once `delay` has elapsed
    pub fn schedule<F>(&mut self, delay: Duration, work: F) -> TimerId
    where
        F: FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    {
        let id = self.handle.allocate_timer_id();
        self.insert(id, delay, Box::new(work));
        id
    }

    pub(crate) fn insert(&mut self, id: TimerId, delay: Duration, work: Work<S>) {
        let deadline = Instant::now() + delay;
        self.deadlines.push(Reverse((deadline, id)));
        self.pending.insert(id, work);
        tracing::trace!("Scheduled {} in {:?}", id, delay);
    }

    /// Cancel a pending timer
    ///
    /// Returns `false` when the timer already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let removed = self.pending.remove(&id).is_some();
        if removed {
            tracing::trace!("Cancelled {}", id);
        }
        removed
    }

    /// Whether the timer is still waiting to fire
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of timers waiting to fire
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Earliest deadline among live timers
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if self.pending.contains_key(&id) {
                return Some(deadline);
            }
            // cancelled, discard lazily
            self.deadlines.pop();
        }
        None
    }

    /// Pop the next timer whose deadline is not after `now`
    pub(crate) fn take_due(&mut self, now: Instant) -> Option<(TimerId, Work<S>)> {
        loop {
            let Reverse((deadline, id)) = *self.deadlines.peek()?;
            if deadline > now {
                return None;
            }
            self.deadlines.pop();
            if let Some(work) = self.pending.remove(&id) {
                return Some((id, work));
            }
        }
    }
}

impl<S> fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("loop", &self.handle.name())
            .field("pending_timers", &self.pending.len())
            .finish()
    }
}

// Timer ids are allocated from the shared counter so that handles on other
// threads can return an id before the loop has processed the request.
impl<S> LoopHandle<S> {
    pub(crate) fn allocate_timer_id(&self) -> TimerId {
        TimerId::new(self.shared().next_timer_id.fetch_add(1, Ordering::Relaxed))
    }
}
