//! Caller-facing controller
//!
//! [`Controller`] owns the event loop and the registered backends. Every
//! method is callable from any thread; operations on device sessions,
//! routing and streams are marshalled onto the loop, while no-ack lists are
//! updated directly under the loop's own lock.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use event_loop::{EventLoop, LoopHandle, Scheduler};
use skylink_stream::{CloseReason, Sink, SinkConfig, SinkListener, StreamListener, StreamState};

use crate::backend::{BackendController, BackendEventSink, TcpProxy};
use crate::command::log;
use crate::command::{encoder, Command};
use crate::config::ControllerConfig;
use crate::device::{DeviceHandle, DeviceInfo};
use crate::error::{EncodeError, Result};
use crate::noack::{NoAckLoop, NoAckLoopStats, NoAckSlot, NoAckTransition};
use crate::request::media::MediaItem;
use crate::request::{
    request_pair, CancelHook, FtpServerType, Request, RequestReporter, TransferBackend,
    TransferKind,
};
use crate::router::RouterStats;
use crate::session::{
    CommandListener, CommandRegistration, ConnectionState, DeviceListener, ListenerFlags, ListenerId,
    SessionSnapshot,
};
use crate::state::ControllerState;
use crate::stream::StreamId;

/// Observer of the set of known devices
///
/// Callbacks run on the controller event loop and must not block.
pub trait ControllerListener: Send {
    fn on_device_added(&mut self, _device: &DeviceInfo) {}

    fn on_device_removed(&mut self, _device: &DeviceInfo) {}
}

/// Builder for [`Controller`]
pub struct ControllerBuilder {
    config: ControllerConfig,
    backends: Vec<Arc<dyn BackendController>>,
    listener: Option<Box<dyn ControllerListener>>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
            backends: Vec::new(),
            listener: None,
        }
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a transport; devices are routed to the backend that
    /// discovered them
    pub fn backend(mut self, backend: impl BackendController + 'static) -> Self {
        self.backends.push(Arc::new(backend));
        self
    }

    pub fn shared_backend(mut self, backend: Arc<dyn BackendController>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn listener(mut self, listener: impl ControllerListener + 'static) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Validate the configuration, spawn the event loop and start backends
    pub fn build(self) -> Result<Controller> {
        let Self {
            config,
            backends,
            listener,
        } = self;
        config.validate()?;

        log::set_level(config.command_log_level);
        if !config.frequent_commands.is_empty()
            && !log::init_frequent_commands(config.frequent_commands.iter().copied())
        {
            tracing::debug!("Frequent commands already installed, keeping the first set");
        }

        let no_ack_loops = Arc::new(DashMap::new());
        let listener_flags = Arc::new(ListenerFlags::new());
        let state = ControllerState::new(
            config.clone(),
            backends.clone(),
            Arc::clone(&no_ack_loops),
            Arc::clone(&listener_flags),
            listener,
        );
        let event_loop = EventLoop::spawn(config.loop_thread_name.clone(), state)?;
        let handle = event_loop.handle();

        for (index, backend) in backends.iter().enumerate() {
            if let Err(e) = backend.start(BackendEventSink::new(handle.clone(), index)) {
                tracing::error!("Failed to start {} backend: {}", backend.backend_type(), e);
                backends[..index].iter().for_each(|started| started.stop());
                return Err(e.into());
            }
        }

        tracing::info!(
            "Controller '{}' {} started with {} backends",
            config.descriptor,
            config.version,
            backends.len()
        );
        Ok(Controller {
            event_loop: Some(event_loop),
            handle,
            backends,
            no_ack_loops,
            listener_flags,
            config,
        })
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for commanding devices
///
/// Methods returning `bool` report whether the operation was accepted;
/// misuse (unknown device, wrong state) is logged and returns `false`. When
/// called from a callback, i.e. on the event loop itself, these operations
/// are queued after the current callback and `true` only means queued.
pub struct Controller {
    event_loop: Option<EventLoop<ControllerState>>,
    handle: LoopHandle<ControllerState>,
    backends: Vec<Arc<dyn BackendController>>,
    no_ack_loops: Arc<DashMap<DeviceHandle, NoAckLoop>>,
    listener_flags: Arc<ListenerFlags>,
    config: ControllerConfig,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn submit<F>(&self, operation: &'static str, work: F) -> bool
    where
        F: FnOnce(&mut ControllerState, &mut Scheduler<ControllerState>) -> bool + Send + 'static,
    {
        let outcome = if self.handle.is_loop_thread() {
            self.handle
                .post(move |state, scheduler| {
                    work(state, scheduler);
                })
                .map(|()| true)
        } else {
            self.handle.post_and_wait(work)
        };

        outcome.unwrap_or_else(|e| {
            tracing::warn!("{} failed: {}", operation, e);
            false
        })
    }

    fn call<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&mut ControllerState, &mut Scheduler<ControllerState>) -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.handle.post_and_wait(work)?)
    }

    fn inspect<F, R>(&self, operation: &'static str, work: F) -> R
    where
        F: FnOnce(&mut ControllerState) -> R + Send + 'static,
        R: Send + Default + 'static,
    {
        self.call(move |state, _| work(state)).unwrap_or_else(|e| {
            tracing::warn!("{} failed: {}", operation, e);
            R::default()
        })
    }

    // Devices

    /// Start connecting to a discovered device
    ///
    /// `listener` receives `on_connecting` right away and is owned by the
    /// session until it ends. Returns `false` (dropping the listener) when
    /// the device is unknown or already connecting or connected.
    pub fn connect_device(&self, handle: DeviceHandle, listener: impl DeviceListener + 'static) -> bool {
        let listener: Box<dyn DeviceListener> = Box::new(listener);
        self.submit("connect_device", move |state, scheduler| {
            state.connect(handle, listener, scheduler)
        })
    }

    /// Disconnect a device, or cancel an ongoing connection attempt
    pub fn disconnect_device(&self, handle: DeviceHandle) -> bool {
        self.submit("disconnect_device", move |state, scheduler| {
            state.disconnect(handle, scheduler)
        })
    }

    /// Encode a command and send it to a connected device
    pub fn send_command<F>(&self, handle: DeviceHandle, encode: F) -> bool
    where
        F: FnOnce(&mut Command) -> std::result::Result<(), EncodeError> + Send + 'static,
    {
        let encode = encoder(encode);
        self.submit("send_command", move |state, _| state.send_command(handle, encode))
    }

    /// Receive every command of a connected device
    ///
    /// Returns `None` when the device is not connected. Registrations are
    /// dropped when the device disconnects. From a callback the registration
    /// is queued: the id is returned right away and the listener starts
    /// receiving if the device is still connected once the callback returns.
    pub fn add_command_listener(
        &self,
        handle: DeviceHandle,
        listener: impl CommandListener + 'static,
    ) -> Option<ListenerId> {
        let id = ListenerId::next();
        let active = Arc::new(AtomicBool::new(true));
        let registration = CommandRegistration::new(id, Arc::new(listener), Arc::clone(&active));
        self.listener_flags.insert((handle, id), active);

        if self.handle.is_loop_thread() {
            let posted = self.handle.post(move |state, _| {
                state.add_command_listener(handle, registration);
            });
            return match posted {
                Ok(()) => Some(id),
                Err(e) => {
                    tracing::warn!("add_command_listener failed: {}", e);
                    self.listener_flags.remove(&(handle, id));
                    None
                }
            };
        }

        match self.call(move |state, _| state.add_command_listener(handle, registration)) {
            Ok(true) => Some(id),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!("add_command_listener failed: {}", e);
                self.listener_flags.remove(&(handle, id));
                None
            }
        }
    }

    /// Stop delivering commands to a listener
    ///
    /// Takes effect immediately from any thread, including the listener's
    /// own callback: no command is delivered to it once this returns `true`.
    /// Returns `false` for an unknown or already removed registration.
    pub fn remove_command_listener(&self, handle: DeviceHandle, id: ListenerId) -> bool {
        let Some((_, active)) = self.listener_flags.remove(&(handle, id)) else {
            tracing::debug!("Unknown command listener {} on {}", id, handle);
            return false;
        };
        active.store(false, Ordering::Release);
        self.submit("remove_command_listener", move |state, _| {
            state.remove_command_listener(handle, id)
        });
        true
    }

    /// Devices currently known, ordered by handle
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.inspect("devices", |state| state.devices())
    }

    /// Connection state, `None` for an unknown device
    pub fn connection_state(&self, handle: DeviceHandle) -> Option<ConnectionState> {
        self.session(handle).map(|snapshot| snapshot.state)
    }

    pub fn session(&self, handle: DeviceHandle) -> Option<SessionSnapshot> {
        self.inspect("session", move |state| state.snapshot(handle))
    }

    pub fn router_stats(&self) -> RouterStats {
        self.inspect("router_stats", |state| state.router_stats())
    }

    /// Open a local TCP endpoint forwarded to `port` on a connected device
    pub fn create_tcp_proxy(&self, handle: DeviceHandle, device_type: i32, port: u16) -> Result<TcpProxy> {
        self.call(move |state, _| state.create_tcp_proxy(handle, device_type, port))?
    }

    // No-ack loops

    /// Create the no-ack loop of a connected device
    ///
    /// The loop is stopped until a non-empty list is set and is deleted when
    /// the device disconnects.
    pub fn create_no_ack_loop(&self, handle: DeviceHandle, period: Duration) -> Result<()> {
        self.call(move |state, _| state.create_no_ack_loop(handle, period))?
    }

    /// Create a no-ack loop with the configured default period
    pub fn create_default_no_ack_loop(&self, handle: DeviceHandle) -> Result<()> {
        self.create_no_ack_loop(handle, self.config.default_no_ack_period)
    }

    pub fn delete_no_ack_loop(&self, handle: DeviceHandle) -> bool {
        match self.no_ack_loops.remove(&handle) {
            Some((_, no_ack)) => {
                no_ack.reset();
                true
            }
            None => false,
        }
    }

    /// Replace the periodic command list of a device
    ///
    /// Callable from any thread, including no-ack factories' callers and
    /// device callbacks. Returns `None` when the device has no loop.
    pub fn set_no_ack_commands(&self, slots: Vec<NoAckSlot>, handle: DeviceHandle) -> Option<NoAckTransition> {
        match self.no_ack_loops.get(&handle) {
            Some(no_ack) => Some(no_ack.set_encoder_list(slots)),
            None => {
                tracing::debug!("No no-ack loop for {}", handle);
                None
            }
        }
    }

    pub fn no_ack_stats(&self, handle: DeviceHandle) -> Option<NoAckLoopStats> {
        self.no_ack_loops.get(&handle).map(|no_ack| no_ack.stats())
    }

    // Requests

    fn start_request<T, P, F>(&self, handle: DeviceHandle, kind: TransferKind, start: F) -> Result<Request<T, P>>
    where
        T: Send + 'static,
        P: Send + 'static,
        F: FnOnce(&dyn TransferBackend, RequestReporter<T, P>) -> CancelHook + Send + 'static,
    {
        self.call(move |state, _| {
            let transfers = state.transfer_backend(handle)?;
            let (request, reporter) = request_pair(kind);
            state.track_request(handle, request.abortable());
            let hook = start(transfers.as_ref(), reporter);
            request.set_cancel_hook(hook);
            tracing::debug!("{} ({:?}) started on {}", request.id(), kind, handle);
            Ok(request)
        })?
    }

    /// List the media stored on the device
    pub fn list_media(&self, handle: DeviceHandle) -> Result<Request<Vec<MediaItem>, ()>> {
        self.start_request(handle, TransferKind::ListMedia, move |transfers, reporter| {
            transfers.list_media(handle, reporter)
        })
    }

    pub fn download_thumbnail(&self, handle: DeviceHandle, media: &MediaItem) -> Result<Request<Bytes, ()>> {
        let media = media.clone();
        self.start_request(handle, TransferKind::DownloadThumbnail, move |transfers, reporter| {
            transfers.download_thumbnail(handle, &media, reporter)
        })
    }

    /// Download every resource of `media` into `destination`; progress in
    /// percent
    pub fn download_media(
        &self,
        handle: DeviceHandle,
        media: &MediaItem,
        destination: impl AsRef<Path>,
    ) -> Result<Request<Vec<std::path::PathBuf>, u8>> {
        let media = media.clone();
        let destination = destination.as_ref().to_path_buf();
        self.start_request(handle, TransferKind::DownloadMedia, move |transfers, reporter| {
            transfers.download_media(handle, &media, &destination, reporter)
        })
    }

    pub fn delete_media(&self, handle: DeviceHandle, media: &MediaItem) -> Result<Request<(), ()>> {
        let media = media.clone();
        self.start_request(handle, TransferKind::DeleteMedia, move |transfers, reporter| {
            transfers.delete_media(handle, &media, reporter)
        })
    }

    /// Upload and apply a firmware file; progress as a fraction
    pub fn update_firmware(&self, handle: DeviceHandle, firmware: impl AsRef<Path>) -> Result<Request<(), f32>> {
        let firmware = firmware.as_ref().to_path_buf();
        self.start_request(handle, TransferKind::UpdateFirmware, move |transfers, reporter| {
            transfers.update_firmware(handle, &firmware, reporter)
        })
    }

    pub fn ftp_upload(
        &self,
        handle: DeviceHandle,
        server: FtpServerType,
        source: impl AsRef<Path>,
        destination: &str,
    ) -> Result<Request<(), f32>> {
        let source = source.as_ref().to_path_buf();
        let destination = destination.to_string();
        self.start_request(handle, TransferKind::FtpUpload, move |transfers, reporter| {
            transfers.ftp_upload(handle, server, &source, &destination, reporter)
        })
    }

    /// Download crash reports; completes with the number of reports
    pub fn download_crashml(&self, handle: DeviceHandle, destination: impl AsRef<Path>) -> Result<Request<usize, u8>> {
        let destination = destination.as_ref().to_path_buf();
        self.start_request(handle, TransferKind::DownloadCrashml, move |transfers, reporter| {
            transfers.download_crashml(handle, &destination, reporter)
        })
    }

    /// Download flight logs; completes with the number of logs
    pub fn download_flight_log(
        &self,
        handle: DeviceHandle,
        destination: impl AsRef<Path>,
    ) -> Result<Request<usize, u8>> {
        let destination = destination.as_ref().to_path_buf();
        self.start_request(handle, TransferKind::DownloadFlightLog, move |transfers, reporter| {
            transfers.download_flight_log(handle, &destination, reporter)
        })
    }

    // Streams

    /// Create and open a stream on a connected device
    ///
    /// `stream_did_open` follows once the native stream is ready.
    pub fn open_stream(
        &self,
        handle: DeviceHandle,
        track: &str,
        listener: impl StreamListener + 'static,
    ) -> Result<StreamId> {
        let track = track.to_string();
        let listener: Box<dyn StreamListener> = Box::new(listener);
        self.call(move |state, _| state.open_stream(handle, &track, listener))?
    }

    pub fn close_stream(&self, stream: StreamId, reason: CloseReason) -> bool {
        self.submit("close_stream", move |state, _| {
            state.with_stream(stream, |session| session.close(reason)).unwrap_or(false)
        })
    }

    pub fn play(&self, stream: StreamId) -> bool {
        self.submit("play", move |state, _| {
            state.with_stream(stream, |session| session.play()).unwrap_or(false)
        })
    }

    pub fn pause(&self, stream: StreamId) -> bool {
        self.submit("pause", move |state, _| {
            state.with_stream(stream, |session| session.pause()).unwrap_or(false)
        })
    }

    pub fn seek_to(&self, stream: StreamId, position_ms: i64) -> bool {
        self.submit("seek_to", move |state, _| {
            state
                .with_stream(stream, |session| session.seek_to(position_ms))
                .unwrap_or(false)
        })
    }

    /// Start a sink on an open stream for one of its media
    pub fn start_sink<L: SinkListener>(
        &self,
        stream: StreamId,
        media_id: u32,
        config: SinkConfig,
        listener: L,
    ) -> Result<Sink> {
        self.call(move |state, _| state.start_sink(stream, media_id, config, listener))?
    }

    pub fn stream_state(&self, stream: StreamId) -> Option<StreamState> {
        self.inspect("stream_state", move |state| state.stream_state(stream))
    }

    /// Close a stream if still open and forget it
    pub fn release_stream(&self, stream: StreamId) -> bool {
        self.submit("release_stream", move |state, _| state.release_stream(stream))
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // no shard lock may be held while a loop thread joins
        let handles: Vec<DeviceHandle> = self.no_ack_loops.iter().map(|entry| *entry.key()).collect();
        for handle in handles {
            self.no_ack_loops.remove(&handle);
        }
        for backend in &self.backends {
            backend.stop();
        }
        drop(self.event_loop.take());
        tracing::info!("Controller '{}' stopped", self.config.descriptor);
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("descriptor", &self.config.descriptor)
            .field("backends", &self.backends.len())
            .field("no_ack_loops", &self.no_ack_loops.len())
            .finish()
    }
}
