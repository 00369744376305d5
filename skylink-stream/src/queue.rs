//! Bounded frame queue with configurable overflow policy

use std::collections::VecDeque;

use crate::types::Frame;

/// What to do when a frame arrives at a full queue.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default)]
pub enum OverflowPolicy {
    /// Discard the queue head to admit the new frame (most recent wins)
    #[default]
    DropEldest,
    /// Discard the incoming frame (oldest wins)
    DropNew,
}

/// Result of pushing a frame into a [`FrameQueue`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PushOutcome {
    /// The frame was queued without loss
    Queued,
    /// The frame was queued after evicting the eldest frame
    EvictedEldest,
    /// The queue was full and the frame was discarded
    DroppedNew,
    /// The queue is waiting for a sync frame and the frame was discarded
    AwaitingSync,
    /// The sink no longer accepts frames
    Rejected,
}

impl PushOutcome {
    /// Whether the pushed frame ended up in the queue.
    pub fn is_queued(&self) -> bool {
        matches!(self, PushOutcome::Queued | PushOutcome::EvictedEldest)
    }
}

/// Fixed-capacity FIFO of frames.
///
/// The length never exceeds the capacity.
#[derive(Debug)]
pub struct FrameQueue {
    frames: VecDeque<Frame>,
    capacity: usize,
    policy: OverflowPolicy,
    awaiting_sync: bool,
    evicted: u64,
    dropped_new: u64,
    dropped_unsynced: u64,
}

impl FrameQueue {
    /// Create a queue. A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            policy,
            awaiting_sync: false,
            evicted: 0,
            dropped_new: 0,
            dropped_unsynced: 0,
        }
    }

    /// Push a frame, applying the overflow policy when full.
    pub fn push(&mut self, frame: Frame) -> PushOutcome {
        if self.awaiting_sync {
            if !frame.is_sync {
                self.dropped_unsynced += 1;
                return PushOutcome::AwaitingSync;
            }
            self.awaiting_sync = false;
        }

        if self.frames.len() < self.capacity {
            self.frames.push_back(frame);
            return PushOutcome::Queued;
        }

        match self.policy {
            OverflowPolicy::DropEldest => {
                self.frames.pop_front();
                self.frames.push_back(frame);
                self.evicted += 1;
                PushOutcome::EvictedEldest
            }
            OverflowPolicy::DropNew => {
                self.dropped_new += 1;
                PushOutcome::DroppedNew
            }
        }
    }

    /// Take the eldest frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Discard all queued frames.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Discard all queued frames and ignore incoming ones until a sync frame.
    pub fn resynchronize(&mut self) {
        self.frames.clear();
        self.awaiting_sync = true;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Whether incoming non-sync frames are currently discarded.
    pub fn is_awaiting_sync(&self) -> bool {
        self.awaiting_sync
    }

    /// Frames evicted from the head under [`OverflowPolicy::DropEldest`].
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    /// Incoming frames discarded under [`OverflowPolicy::DropNew`].
    pub fn dropped_new_count(&self) -> u64 {
        self.dropped_new
    }

    /// Incoming frames discarded while waiting for a sync frame.
    pub fn dropped_unsynced_count(&self) -> u64 {
        self.dropped_unsynced
    }
}
