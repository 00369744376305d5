//! Stream sessions owned by the controller
//!
//! Each stream is bound to the device it was opened on and identified by a
//! [`StreamId`] that backends use to route native stream events.

use std::collections::BTreeMap;

use skylink_stream::{CloseReason, StreamSession, StreamState};

use crate::device::DeviceHandle;

/// Identifier of a stream opened through the controller
pub type StreamId = u32;

pub(crate) struct StreamEntry {
    pub handle: DeviceHandle,
    pub session: StreamSession,
}

/// Streams of all devices, keyed by id
pub(crate) struct StreamTable {
    entries: BTreeMap<StreamId, StreamEntry>,
    next_id: StreamId,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn allocate_id(&mut self) -> StreamId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    pub fn insert(&mut self, id: StreamId, handle: DeviceHandle, session: StreamSession) {
        self.entries.insert(id, StreamEntry { handle, session });
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamSession> {
        self.entries.get_mut(&id).map(|entry| &mut entry.session)
    }

    pub fn state(&self, id: StreamId) -> Option<StreamState> {
        self.entries.get(&id).map(|entry| entry.session.state())
    }

    pub fn remove(&mut self, id: StreamId) -> Option<StreamEntry> {
        self.entries.remove(&id)
    }

    /// Close every stream of `handle` without waiting for native events
    pub fn terminate_device(&mut self, handle: DeviceHandle, reason: CloseReason) -> usize {
        let mut closed = 0;
        for entry in self.entries.values_mut().filter(|entry| entry.handle == handle) {
            if entry.session.state() != StreamState::Closed {
                entry.session.terminate(reason);
                closed += 1;
            }
        }
        closed
    }

    /// Drop every stream of `handle`
    pub fn remove_device(&mut self, handle: DeviceHandle) {
        self.entries.retain(|_, entry| entry.handle != handle);
    }
}
