//! Channel adapter for device callbacks
//!
//! [`ChannelDeviceListener`] turns [`DeviceListener`] callbacks into
//! [`DeviceEvent`] values consumed from any thread through [`DeviceEvents`],
//! for callers that prefer pulling events to implementing a trait.

use std::sync::mpsc;
use std::time::Duration;

use crate::command::Command;
use crate::device::{ApiCapabilities, DeviceHandle};
use crate::session::{CancelReason, DeviceListener};

/// A device callback as a value
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connecting(DeviceHandle),
    Connected(DeviceHandle, ApiCapabilities),
    Disconnected {
        handle: DeviceHandle,
        removing: bool,
    },
    ConnectionCanceled {
        handle: DeviceHandle,
        reason: CancelReason,
        removing: bool,
    },
    LinkDown(DeviceHandle),
    CommandReceived(DeviceHandle, Command),
}

impl DeviceEvent {
    pub fn handle(&self) -> DeviceHandle {
        match self {
            DeviceEvent::Connecting(handle)
            | DeviceEvent::Connected(handle, _)
            | DeviceEvent::Disconnected { handle, .. }
            | DeviceEvent::ConnectionCanceled { handle, .. }
            | DeviceEvent::LinkDown(handle)
            | DeviceEvent::CommandReceived(handle, _) => *handle,
        }
    }

    /// Whether this event ends the connection
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeviceEvent::Disconnected { .. } | DeviceEvent::ConnectionCanceled { .. }
        )
    }
}

/// Device listener forwarding every callback into a channel
pub struct ChannelDeviceListener {
    handle: DeviceHandle,
    tx: mpsc::Sender<DeviceEvent>,
}

impl ChannelDeviceListener {
    /// Create the listener for `handle` and the receiving end
    pub fn new(handle: DeviceHandle) -> (Self, DeviceEvents) {
        let (tx, rx) = mpsc::channel();
        (Self { handle, tx }, DeviceEvents { rx })
    }

    fn send(&self, event: DeviceEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Device events receiver for {} dropped", self.handle);
        }
    }
}

impl DeviceListener for ChannelDeviceListener {
    fn on_connecting(&mut self) {
        self.send(DeviceEvent::Connecting(self.handle));
    }

    fn on_connected(&mut self, capabilities: ApiCapabilities) {
        self.send(DeviceEvent::Connected(self.handle, capabilities));
    }

    fn on_disconnected(&mut self, removing: bool) {
        self.send(DeviceEvent::Disconnected {
            handle: self.handle,
            removing,
        });
    }

    fn on_connection_cancel(&mut self, reason: CancelReason, removing: bool) {
        self.send(DeviceEvent::ConnectionCanceled {
            handle: self.handle,
            reason,
            removing,
        });
    }

    fn on_link_down(&mut self) {
        self.send(DeviceEvent::LinkDown(self.handle));
    }

    fn on_command_received(&mut self, command: &Command) {
        self.send(DeviceEvent::CommandReceived(self.handle, command.clone()));
    }
}

/// Receiving end of a [`ChannelDeviceListener`]
///
/// The channel closes once the session released the listener (after the
/// terminal event), so blocking iteration ends by itself.
pub struct DeviceEvents {
    rx: mpsc::Receiver<DeviceEvent>,
}

impl DeviceEvents {
    /// Block until an event is available
    ///
    /// Returns `None` if the channel is closed.
    pub fn recv(&self) -> Option<DeviceEvent> {
        self.rx.recv().ok()
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<DeviceEvent> {
        self.rx.try_recv().ok()
    }

    /// Block until an event is available or timeout expires
    pub fn recv_timeout(&self, timeout: Duration) -> Option<DeviceEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking iterator over currently available events
    pub fn try_iter(&self) -> impl Iterator<Item = DeviceEvent> + '_ {
        self.rx.try_iter()
    }

    /// Blocking iterator with timeout
    ///
    /// Blocks for up to `timeout` on each call to `next()`.
    pub fn timeout_iter(&self, timeout: Duration) -> TimeoutIterator<'_> {
        TimeoutIterator {
            inner: self,
            timeout,
        }
    }
}

impl Iterator for DeviceEvents {
    type Item = DeviceEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

/// Blocking iterator with timeout
pub struct TimeoutIterator<'a> {
    inner: &'a DeviceEvents,
    timeout: Duration,
}

impl<'a> Iterator for TimeoutIterator<'a> {
    type Item = DeviceEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.recv_timeout(self.timeout)
    }
}
