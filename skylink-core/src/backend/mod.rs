//! Transport backends
//!
//! A [`BackendController`] owns one transport (Wi-Fi, BLE, tunnel). It
//! reports device presence, connection progress and received bytes through
//! the [`BackendEventSink`] handed to it on start; the sink marshals every
//! report onto the controller event loop whatever thread it is called from.

pub mod loopback;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use event_loop::LoopHandle;
use skylink_stream::{NativeStream, NativeStreamEvent};

use crate::command::{BufferType, Command};
use crate::device::{ApiCapabilities, BackendType, DeviceHandle, DeviceInfo};
use crate::error::BackendError;
use crate::request::TransferBackend;
use crate::session::CancelReason;
use crate::state::ControllerState;
use crate::stream::StreamId;

/// Identity the controller presents to devices when connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerDescriptor {
    pub name: String,
    pub version: String,
}

/// Local endpoint of a TCP proxy to a device service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpProxy {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for TcpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A transport implementation
///
/// All methods are called from the controller event loop, except `stop`
/// which is also called on controller drop. Implementations must not block.
pub trait BackendController: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Start discovery and keep `events` to report to the controller
    fn start(&self, events: BackendEventSink) -> Result<(), BackendError>;

    fn stop(&self);

    /// Start the connection handshake with a discovered device
    fn connect(
        &self,
        device: &DeviceInfo,
        descriptor: &ControllerDescriptor,
    ) -> Result<(), BackendError>;

    /// Disconnect a connected device or abort a connection attempt
    fn disconnect(&self, handle: DeviceHandle) -> Result<(), BackendError>;

    /// Transmit a command
    fn send(&self, handle: DeviceHandle, command: Command) -> Result<(), BackendError>;

    /// Open a local TCP endpoint forwarded to `port` on the device
    fn create_tcp_proxy(
        &self,
        _handle: DeviceHandle,
        _device_type: i32,
        _port: u16,
    ) -> Result<TcpProxy, BackendError> {
        Err(BackendError::Unsupported("tcp proxy"))
    }

    /// Create the native side of a video stream
    ///
    /// Stream events are reported through [`BackendEventSink::stream_event`]
    /// with the given `stream` id.
    fn create_stream(
        &self,
        _handle: DeviceHandle,
        _stream: StreamId,
        _track: &str,
    ) -> Result<Box<dyn NativeStream>, BackendError> {
        Err(BackendError::Unsupported("streaming"))
    }

    /// File transfer protocols, if the transport supports them
    fn transfers(&self) -> Option<Arc<dyn TransferBackend>> {
        None
    }
}

/// Report from a backend, applied on the event loop
#[derive(Debug)]
pub(crate) enum BackendEvent {
    DeviceAdded(DeviceInfo),
    DeviceRemoved(DeviceHandle),
    Connected(DeviceHandle, ApiCapabilities),
    ConnectionCanceled {
        handle: DeviceHandle,
        reason: CancelReason,
        removing: bool,
    },
    Disconnected {
        handle: DeviceHandle,
        removing: bool,
    },
    LinkDown(DeviceHandle),
    CommandReceived {
        handle: DeviceHandle,
        buffer: BufferType,
        raw: Bytes,
    },
    Stream(StreamId, NativeStreamEvent),
}

/// Thread-safe entry point for backend reports
#[derive(Clone)]
pub struct BackendEventSink {
    handle: LoopHandle<ControllerState>,
    backend: usize,
}

impl BackendEventSink {
    pub(crate) fn new(handle: LoopHandle<ControllerState>, backend: usize) -> Self {
        Self { handle, backend }
    }

    fn post(&self, event: BackendEvent) {
        let backend = self.backend;
        let posted = self
            .handle
            .post(move |state, scheduler| state.handle_backend_event(backend, event, scheduler));
        if let Err(e) = posted {
            tracing::debug!("Dropping backend event: {}", e);
        }
    }

    /// A device was discovered
    pub fn device_added(&self, info: DeviceInfo) {
        self.post(BackendEvent::DeviceAdded(info));
    }

    /// A device left the known set
    pub fn device_removed(&self, handle: DeviceHandle) {
        self.post(BackendEvent::DeviceRemoved(handle));
    }

    /// The connection handshake completed
    pub fn connected(&self, handle: DeviceHandle, capabilities: ApiCapabilities) {
        self.post(BackendEvent::Connected(handle, capabilities));
    }

    /// The connection attempt ended before completing
    pub fn connection_canceled(&self, handle: DeviceHandle, reason: CancelReason, removing: bool) {
        self.post(BackendEvent::ConnectionCanceled {
            handle,
            reason,
            removing,
        });
    }

    /// A connected device disconnected
    pub fn disconnected(&self, handle: DeviceHandle, removing: bool) {
        self.post(BackendEvent::Disconnected { handle, removing });
    }

    /// The link can temporarily not carry data
    pub fn link_down(&self, handle: DeviceHandle) {
        self.post(BackendEvent::LinkDown(handle));
    }

    /// Raw command bytes arrived from a device
    pub fn command_received(&self, handle: DeviceHandle, buffer: BufferType, raw: Bytes) {
        self.post(BackendEvent::CommandReceived {
            handle,
            buffer,
            raw,
        });
    }

    /// Event of a native stream created by this backend
    pub fn stream_event(&self, stream: StreamId, event: NativeStreamEvent) {
        self.post(BackendEvent::Stream(stream, event));
    }
}

impl fmt::Debug for BackendEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEventSink")
            .field("loop", &self.handle.name())
            .field("backend", &self.backend)
            .finish()
    }
}
