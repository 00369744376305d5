//! In-process simulated transport
//!
//! [`LoopbackBackend`] implements [`BackendController`] without any I/O. The
//! owner drives it from the outside: add and remove devices, complete or
//! cancel connection handshakes, inject received commands and inspect what
//! the controller sent. Streams and transfers are simulated too.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use skylink_stream::{CloseReason, NativeStream, NativeStreamEvent};

use super::{BackendController, BackendEventSink, ControllerDescriptor, TcpProxy};
use crate::command::{BufferType, Command};
use crate::device::{ApiCapabilities, BackendType, DeviceHandle, DeviceInfo};
use crate::error::BackendError;
use crate::request::media::MediaItem;
use crate::request::{
    CancelHook, FtpServerType, RequestId, RequestReporter, TransferBackend, TransferKind,
};
use crate::session::CancelReason;
use crate::stream::StreamId;

const FIRST_PROXY_PORT: u16 = 40000;

/// Call made by the controller on a simulated native stream
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    Open,
    Close(CloseReason),
    Play,
    Pause,
    SeekTo(i64),
}

#[derive(Default)]
struct Inner {
    events: Mutex<Option<BackendEventSink>>,
    devices: Mutex<BTreeMap<DeviceHandle, DeviceInfo>>,
    next_handle: AtomicI16,
    sent: Mutex<Vec<(DeviceHandle, Command)>>,
    connect_requests: Mutex<Vec<(DeviceHandle, ControllerDescriptor)>>,
    disconnect_requests: Mutex<Vec<DeviceHandle>>,
    auto_connect: Mutex<Option<ApiCapabilities>>,
    manual_disconnect: AtomicBool,
    fail_sends: AtomicBool,
    next_proxy_port: AtomicU16,
    streams: Mutex<HashMap<StreamId, Arc<Mutex<Vec<NativeCall>>>>>,
}

impl Inner {
    fn sink(&self) -> Option<BackendEventSink> {
        self.events.lock().clone()
    }
}

/// Simulated backend for tests and demos
///
/// Cloning yields another handle to the same simulated transport, so a test
/// can keep one while the controller owns the other.
#[derive(Clone)]
pub struct LoopbackBackend {
    backend_type: BackendType,
    transfers: Option<Arc<LoopbackTransfers>>,
    inner: Arc<Inner>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        let inner = Inner {
            next_handle: AtomicI16::new(1),
            next_proxy_port: AtomicU16::new(FIRST_PROXY_PORT),
            ..Default::default()
        };
        Self {
            backend_type: BackendType::Unknown,
            transfers: Some(Arc::new(LoopbackTransfers::default())),
            inner: Arc::new(inner),
        }
    }

    /// Report devices as discovered on another transport type
    pub fn with_backend_type(mut self, backend_type: BackendType) -> Self {
        self.backend_type = backend_type;
        self
    }

    /// Allocate handles starting at `first`
    pub fn with_first_handle(self, first: i16) -> Self {
        self.inner.next_handle.store(first, Ordering::SeqCst);
        self
    }

    /// Disable file transfers
    pub fn without_transfers(mut self) -> Self {
        self.transfers = None;
        self
    }

    /// Complete every connection handshake immediately with `capabilities`
    pub fn set_auto_connect(&self, capabilities: Option<ApiCapabilities>) {
        *self.inner.auto_connect.lock() = capabilities;
    }

    /// When set, disconnect requests are recorded but not acknowledged
    pub fn set_manual_disconnect(&self, manual: bool) {
        self.inner.manual_disconnect.store(manual, Ordering::SeqCst);
    }

    /// Make every `send` fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Simulated transfers, `None` if disabled
    pub fn transfer_simulator(&self) -> Option<Arc<LoopbackTransfers>> {
        self.transfers.clone()
    }

    /// Discover a new device and return its handle
    pub fn add_device(&self, uid: &str, device_type: i32, name: &str) -> DeviceHandle {
        let handle = DeviceHandle::new(self.inner.next_handle.fetch_add(1, Ordering::SeqCst));
        let info = DeviceInfo {
            uid: uid.to_string(),
            device_type,
            backend_type: self.backend_type,
            name: name.to_string(),
            handle,
        };
        self.inner.devices.lock().insert(handle, info.clone());
        if let Some(sink) = self.inner.sink() {
            sink.device_added(info);
        }
        handle
    }

    /// Lose a device from discovery
    pub fn remove_device(&self, handle: DeviceHandle) -> bool {
        if self.inner.devices.lock().remove(&handle).is_none() {
            return false;
        }
        if let Some(sink) = self.inner.sink() {
            sink.device_removed(handle);
        }
        true
    }

    pub fn complete_connection(&self, handle: DeviceHandle, capabilities: ApiCapabilities) {
        if let Some(sink) = self.inner.sink() {
            sink.connected(handle, capabilities);
        }
    }

    pub fn cancel_connection(&self, handle: DeviceHandle, reason: CancelReason) {
        if let Some(sink) = self.inner.sink() {
            sink.connection_canceled(handle, reason, false);
        }
    }

    /// The device closed the connection
    pub fn remote_disconnect(&self, handle: DeviceHandle) {
        if let Some(sink) = self.inner.sink() {
            sink.disconnected(handle, false);
        }
    }

    pub fn link_down(&self, handle: DeviceHandle) {
        if let Some(sink) = self.inner.sink() {
            sink.link_down(handle);
        }
    }

    /// Deliver `command` as if received from the device
    pub fn inject_command(&self, handle: DeviceHandle, command: &Command) {
        self.inject_raw(handle, command.buffer, command.encode());
    }

    /// Deliver raw bytes as if received from the device
    pub fn inject_raw(&self, handle: DeviceHandle, buffer: BufferType, raw: Bytes) {
        if let Some(sink) = self.inner.sink() {
            sink.command_received(handle, buffer, raw);
        }
    }

    /// Report an event on a simulated stream
    pub fn emit_stream_event(&self, stream: StreamId, event: NativeStreamEvent) {
        if let Some(sink) = self.inner.sink() {
            sink.stream_event(stream, event);
        }
    }

    /// Commands sent so far, in order
    pub fn sent_commands(&self) -> Vec<(DeviceHandle, Command)> {
        self.inner.sent.lock().clone()
    }

    /// Commands sent so far, clearing the record
    pub fn take_sent(&self) -> Vec<(DeviceHandle, Command)> {
        std::mem::take(&mut *self.inner.sent.lock())
    }

    pub fn connect_requests(&self) -> Vec<(DeviceHandle, ControllerDescriptor)> {
        self.inner.connect_requests.lock().clone()
    }

    pub fn disconnect_requests(&self) -> Vec<DeviceHandle> {
        self.inner.disconnect_requests.lock().clone()
    }

    /// Calls made on a simulated stream
    pub fn stream_calls(&self, stream: StreamId) -> Vec<NativeCall> {
        self.inner
            .streams
            .lock()
            .get(&stream)
            .map(|calls| calls.lock().clone())
            .unwrap_or_default()
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendController for LoopbackBackend {
    fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    fn start(&self, events: BackendEventSink) -> Result<(), BackendError> {
        for info in self.inner.devices.lock().values() {
            events.device_added(info.clone());
        }
        *self.inner.events.lock() = Some(events);
        tracing::debug!("Loopback backend started");
        Ok(())
    }

    fn stop(&self) {
        self.inner.events.lock().take();
        tracing::debug!("Loopback backend stopped");
    }

    fn connect(
        &self,
        device: &DeviceInfo,
        descriptor: &ControllerDescriptor,
    ) -> Result<(), BackendError> {
        if !self.inner.devices.lock().contains_key(&device.handle) {
            return Err(BackendError::ConnectFailed {
                handle: device.handle,
                reason: "device not discovered".to_string(),
            });
        }
        self.inner
            .connect_requests
            .lock()
            .push((device.handle, descriptor.clone()));

        let auto_connect = *self.inner.auto_connect.lock();
        if let (Some(capabilities), Some(sink)) = (auto_connect, self.inner.sink()) {
            sink.connected(device.handle, capabilities);
        }
        Ok(())
    }

    fn disconnect(&self, handle: DeviceHandle) -> Result<(), BackendError> {
        self.inner.disconnect_requests.lock().push(handle);
        if !self.inner.manual_disconnect.load(Ordering::SeqCst) {
            if let Some(sink) = self.inner.sink() {
                sink.disconnected(handle, false);
            }
        }
        Ok(())
    }

    fn send(&self, handle: DeviceHandle, command: Command) -> Result<(), BackendError> {
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(BackendError::SendFailed {
                handle,
                reason: "simulated send failure".to_string(),
            });
        }
        if !self.inner.devices.lock().contains_key(&handle) {
            return Err(BackendError::SendFailed {
                handle,
                reason: "device not discovered".to_string(),
            });
        }
        self.inner.sent.lock().push((handle, command));
        Ok(())
    }

    fn create_tcp_proxy(
        &self,
        handle: DeviceHandle,
        _device_type: i32,
        port: u16,
    ) -> Result<TcpProxy, BackendError> {
        let local_port = self.inner.next_proxy_port.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Loopback proxy {}:{} on port {}", handle, port, local_port);
        Ok(TcpProxy {
            address: "127.0.0.1".to_string(),
            port: local_port,
        })
    }

    fn create_stream(
        &self,
        handle: DeviceHandle,
        stream: StreamId,
        track: &str,
    ) -> Result<Box<dyn NativeStream>, BackendError> {
        let events = self
            .inner
            .sink()
            .ok_or_else(|| BackendError::Other("loopback backend not started".to_string()))?;
        let calls = Arc::new(Mutex::new(Vec::new()));
        self.inner.streams.lock().insert(stream, Arc::clone(&calls));
        tracing::debug!("Loopback stream {} for {} ({})", stream, handle, track);
        Ok(Box::new(LoopbackNative {
            stream,
            events,
            calls,
        }))
    }

    fn transfers(&self) -> Option<Arc<dyn TransferBackend>> {
        self.transfers
            .clone()
            .map(|transfers| transfers as Arc<dyn TransferBackend>)
    }
}

/// Native stream that acknowledges open and close right away
struct LoopbackNative {
    stream: StreamId,
    events: BackendEventSink,
    calls: Arc<Mutex<Vec<NativeCall>>>,
}

impl NativeStream for LoopbackNative {
    fn open(&mut self) -> skylink_stream::Result<()> {
        self.calls.lock().push(NativeCall::Open);
        self.events.stream_event(self.stream, NativeStreamEvent::Opened);
        Ok(())
    }

    fn close(&mut self, reason: CloseReason) {
        self.calls.lock().push(NativeCall::Close(reason));
        self.events
            .stream_event(self.stream, NativeStreamEvent::Closed(reason));
    }

    fn play(&mut self) {
        self.calls.lock().push(NativeCall::Play);
    }

    fn pause(&mut self) {
        self.calls.lock().push(NativeCall::Pause);
    }

    fn seek_to(&mut self, position_ms: i64) {
        self.calls.lock().push(NativeCall::SeekTo(position_ms));
    }
}

/// A transfer started on the loopback backend, waiting to be driven
pub enum PendingTransfer {
    ListMedia {
        handle: DeviceHandle,
        reporter: RequestReporter<Vec<MediaItem>, ()>,
    },
    DownloadThumbnail {
        handle: DeviceHandle,
        media: MediaItem,
        reporter: RequestReporter<Bytes, ()>,
    },
    DownloadMedia {
        handle: DeviceHandle,
        media: MediaItem,
        destination: PathBuf,
        reporter: RequestReporter<Vec<PathBuf>, u8>,
    },
    DeleteMedia {
        handle: DeviceHandle,
        media: MediaItem,
        reporter: RequestReporter<(), ()>,
    },
    UpdateFirmware {
        handle: DeviceHandle,
        firmware: PathBuf,
        reporter: RequestReporter<(), f32>,
    },
    FtpUpload {
        handle: DeviceHandle,
        server: FtpServerType,
        source: PathBuf,
        destination: String,
        reporter: RequestReporter<(), f32>,
    },
    DownloadCrashml {
        handle: DeviceHandle,
        destination: PathBuf,
        reporter: RequestReporter<usize, u8>,
    },
    DownloadFlightLog {
        handle: DeviceHandle,
        destination: PathBuf,
        reporter: RequestReporter<usize, u8>,
    },
}

impl PendingTransfer {
    pub fn kind(&self) -> TransferKind {
        match self {
            PendingTransfer::ListMedia { .. } => TransferKind::ListMedia,
            PendingTransfer::DownloadThumbnail { .. } => TransferKind::DownloadThumbnail,
            PendingTransfer::DownloadMedia { .. } => TransferKind::DownloadMedia,
            PendingTransfer::DeleteMedia { .. } => TransferKind::DeleteMedia,
            PendingTransfer::UpdateFirmware { .. } => TransferKind::UpdateFirmware,
            PendingTransfer::FtpUpload { .. } => TransferKind::FtpUpload,
            PendingTransfer::DownloadCrashml { .. } => TransferKind::DownloadCrashml,
            PendingTransfer::DownloadFlightLog { .. } => TransferKind::DownloadFlightLog,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        match self {
            PendingTransfer::ListMedia { handle, .. }
            | PendingTransfer::DownloadThumbnail { handle, .. }
            | PendingTransfer::DownloadMedia { handle, .. }
            | PendingTransfer::DeleteMedia { handle, .. }
            | PendingTransfer::UpdateFirmware { handle, .. }
            | PendingTransfer::FtpUpload { handle, .. }
            | PendingTransfer::DownloadCrashml { handle, .. }
            | PendingTransfer::DownloadFlightLog { handle, .. } => *handle,
        }
    }

    pub fn id(&self) -> RequestId {
        match self {
            PendingTransfer::ListMedia { reporter, .. } => reporter.id(),
            PendingTransfer::DownloadThumbnail { reporter, .. } => reporter.id(),
            PendingTransfer::DownloadMedia { reporter, .. } => reporter.id(),
            PendingTransfer::DeleteMedia { reporter, .. } => reporter.id(),
            PendingTransfer::UpdateFirmware { reporter, .. } => reporter.id(),
            PendingTransfer::FtpUpload { reporter, .. } => reporter.id(),
            PendingTransfer::DownloadCrashml { reporter, .. } => reporter.id(),
            PendingTransfer::DownloadFlightLog { reporter, .. } => reporter.id(),
        }
    }
}

/// Records transfers so a test can drive their progress and completion
#[derive(Default)]
pub struct LoopbackTransfers {
    pending: Mutex<Vec<PendingTransfer>>,
    canceled: Arc<Mutex<Vec<RequestId>>>,
}

impl LoopbackTransfers {
    /// Transfers started since the last call, in start order
    pub fn take_pending(&self) -> Vec<PendingTransfer> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Requests whose cancel hook ran
    pub fn canceled(&self) -> Vec<RequestId> {
        self.canceled.lock().clone()
    }

    fn push(&self, transfer: PendingTransfer) -> CancelHook {
        let id = transfer.id();
        tracing::debug!("Loopback transfer {} ({:?}) started", id, transfer.kind());
        self.pending.lock().push(transfer);
        let canceled = Arc::clone(&self.canceled);
        Box::new(move || canceled.lock().push(id))
    }
}

impl TransferBackend for LoopbackTransfers {
    fn list_media(
        &self,
        handle: DeviceHandle,
        reporter: RequestReporter<Vec<MediaItem>, ()>,
    ) -> CancelHook {
        self.push(PendingTransfer::ListMedia { handle, reporter })
    }

    fn download_thumbnail(
        &self,
        handle: DeviceHandle,
        media: &MediaItem,
        reporter: RequestReporter<Bytes, ()>,
    ) -> CancelHook {
        self.push(PendingTransfer::DownloadThumbnail {
            handle,
            media: media.clone(),
            reporter,
        })
    }

    fn download_media(
        &self,
        handle: DeviceHandle,
        media: &MediaItem,
        destination: &Path,
        reporter: RequestReporter<Vec<PathBuf>, u8>,
    ) -> CancelHook {
        self.push(PendingTransfer::DownloadMedia {
            handle,
            media: media.clone(),
            destination: destination.to_path_buf(),
            reporter,
        })
    }

    fn delete_media(
        &self,
        handle: DeviceHandle,
        media: &MediaItem,
        reporter: RequestReporter<(), ()>,
    ) -> CancelHook {
        self.push(PendingTransfer::DeleteMedia {
            handle,
            media: media.clone(),
            reporter,
        })
    }

    fn update_firmware(
        &self,
        handle: DeviceHandle,
        firmware: &Path,
        reporter: RequestReporter<(), f32>,
    ) -> CancelHook {
        self.push(PendingTransfer::UpdateFirmware {
            handle,
            firmware: firmware.to_path_buf(),
            reporter,
        })
    }

    fn ftp_upload(
        &self,
        handle: DeviceHandle,
        server: FtpServerType,
        source: &Path,
        destination: &str,
        reporter: RequestReporter<(), f32>,
    ) -> CancelHook {
        self.push(PendingTransfer::FtpUpload {
            handle,
            server,
            source: source.to_path_buf(),
            destination: destination.to_string(),
            reporter,
        })
    }

    fn download_crashml(
        &self,
        handle: DeviceHandle,
        destination: &Path,
        reporter: RequestReporter<usize, u8>,
    ) -> CancelHook {
        self.push(PendingTransfer::DownloadCrashml {
            handle,
            destination: destination.to_path_buf(),
            reporter,
        })
    }

    fn download_flight_log(
        &self,
        handle: DeviceHandle,
        destination: &Path,
        reporter: RequestReporter<usize, u8>,
    ) -> CancelHook {
        self.push(PendingTransfer::DownloadFlightLog {
            handle,
            destination: destination.to_path_buf(),
            reporter,
        })
    }
}
