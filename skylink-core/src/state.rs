//! Controller state owned by the event loop
//!
//! Everything here runs on the loop thread: backend reports arrive as
//! [`BackendEvent`]s and caller operations as posted closures, so device
//! sessions, router registrations and streams need no locking. The no-ack
//! loop table and the command listener flags are the exception and are
//! shared with caller threads.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use event_loop::Scheduler;
use skylink_stream::{
    CloseReason, NativeStreamEvent, Sink, SinkConfig, SinkListener, StreamError, StreamListener,
    StreamSession, StreamState,
};

use crate::backend::{BackendController, BackendEvent, ControllerDescriptor, TcpProxy};
use crate::command::log::{self, Direction};
use crate::command::{BufferType, Command, CommandEncoder};
use crate::config::ControllerConfig;
use crate::controller::ControllerListener;
use crate::device::{ApiCapabilities, DeviceHandle, DeviceInfo};
use crate::error::{CoreError, Result};
use crate::noack::{CommandSender, NoAckLoop};
use crate::request::{Abortable, TransferBackend};
use crate::router::{CommandRouter, RouterStats};
use crate::session::{
    CancelReason, CommandRegistration, ConnectionState, DeviceListener, DeviceSession, ListenerFlags,
    ListenerId, SessionSnapshot,
};
use crate::stream::{StreamId, StreamTable};

struct DeviceEntry {
    info: DeviceInfo,
    backend: usize,
    session: DeviceSession,
}

pub(crate) struct ControllerState {
    config: ControllerConfig,
    descriptor: ControllerDescriptor,
    backends: Vec<Arc<dyn BackendController>>,
    devices: BTreeMap<DeviceHandle, DeviceEntry>,
    streams: StreamTable,
    router: CommandRouter,
    no_ack_loops: Arc<DashMap<DeviceHandle, NoAckLoop>>,
    listener_flags: Arc<ListenerFlags>,
    listener: Option<Box<dyn ControllerListener>>,
}

impl ControllerState {
    pub fn new(
        config: ControllerConfig,
        backends: Vec<Arc<dyn BackendController>>,
        no_ack_loops: Arc<DashMap<DeviceHandle, NoAckLoop>>,
        listener_flags: Arc<ListenerFlags>,
        listener: Option<Box<dyn ControllerListener>>,
    ) -> Self {
        let descriptor = ControllerDescriptor {
            name: config.descriptor.clone(),
            version: config.version.clone(),
        };
        Self {
            config,
            descriptor,
            backends,
            devices: BTreeMap::new(),
            streams: StreamTable::new(),
            router: CommandRouter::new(),
            no_ack_loops,
            listener_flags,
            listener,
        }
    }

    pub fn handle_backend_event(
        &mut self,
        backend: usize,
        event: BackendEvent,
        scheduler: &mut Scheduler<ControllerState>,
    ) {
        match event {
            BackendEvent::DeviceAdded(info) => self.device_added(backend, info),
            BackendEvent::DeviceRemoved(handle) => self.device_removed(handle, scheduler),
            BackendEvent::Connected(handle, capabilities) => {
                self.handshake_completed(handle, capabilities, scheduler)
            }
            BackendEvent::ConnectionCanceled {
                handle,
                reason,
                removing,
            } => {
                if let Some(entry) = self.devices.get_mut(&handle) {
                    cancel_connect_timer(&mut entry.session, scheduler);
                    entry.session.cancel(reason, removing);
                }
            }
            BackendEvent::Disconnected { handle, removing } => {
                self.connection_lost(handle, removing, scheduler)
            }
            BackendEvent::LinkDown(handle) => {
                if let Some(entry) = self.devices.get_mut(&handle) {
                    entry.session.link_down();
                }
            }
            BackendEvent::CommandReceived {
                handle,
                buffer,
                raw,
            } => self.command_received(handle, buffer, raw),
            BackendEvent::Stream(id, event) => self.stream_event(id, event),
        }
    }

    fn device_added(&mut self, backend: usize, info: DeviceInfo) {
        let handle = info.handle;
        if !handle.is_valid() {
            tracing::warn!("Ignoring device '{}' reported with an invalid handle", info.uid);
            return;
        }
        if self.devices.contains_key(&handle) {
            tracing::debug!("Device {} already known", handle);
            return;
        }

        tracing::info!(
            "Device added: {} '{}' ({}) on {} backend",
            handle,
            info.name,
            info.uid,
            info.backend_type
        );
        if let Some(listener) = self.listener.as_mut() {
            listener.on_device_added(&info);
        }
        self.devices.insert(
            handle,
            DeviceEntry {
                info,
                backend,
                session: DeviceSession::new(handle),
            },
        );
    }

    fn device_removed(&mut self, handle: DeviceHandle, scheduler: &mut Scheduler<ControllerState>) {
        let state = match self.devices.get(&handle) {
            Some(entry) => entry.session.state(),
            None => {
                tracing::debug!("Removal of unknown device {}", handle);
                return;
            }
        };

        match state {
            ConnectionState::Connecting => {
                if let Some(entry) = self.devices.get_mut(&handle) {
                    cancel_connect_timer(&mut entry.session, scheduler);
                    entry.session.cancel(CancelReason::Remote, true);
                }
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                self.teardown(handle, true);
            }
            ConnectionState::Idle | ConnectionState::Canceled => {}
        }

        self.streams.remove_device(handle);
        if let Some((_, no_ack)) = self.no_ack_loops.remove(&handle) {
            no_ack.reset();
        }
        if let Some(entry) = self.devices.remove(&handle) {
            tracing::info!("Device removed: {} '{}'", handle, entry.info.name);
            if let Some(listener) = self.listener.as_mut() {
                listener.on_device_removed(&entry.info);
            }
        }
    }

    fn handshake_completed(
        &mut self,
        handle: DeviceHandle,
        capabilities: ApiCapabilities,
        scheduler: &mut Scheduler<ControllerState>,
    ) {
        if let Some(entry) = self.devices.get_mut(&handle) {
            cancel_connect_timer(&mut entry.session, scheduler);
            entry.session.connected(capabilities);
        } else {
            tracing::debug!("Connection completed for unknown device {}", handle);
        }
    }

    fn connection_lost(
        &mut self,
        handle: DeviceHandle,
        removing: bool,
        scheduler: &mut Scheduler<ControllerState>,
    ) {
        let Some(entry) = self.devices.get_mut(&handle) else {
            tracing::debug!("Disconnection of unknown device {}", handle);
            return;
        };

        match entry.session.state() {
            ConnectionState::Connecting => {
                cancel_connect_timer(&mut entry.session, scheduler);
                entry.session.disconnected(removing);
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                self.teardown(handle, removing);
            }
            state => tracing::debug!("Ignoring disconnection of {} ({})", handle, state),
        }
    }

    /// End a connected session: stop periodic sends, close streams, then let
    /// the session drop listeners, abort requests and notify
    fn teardown(&mut self, handle: DeviceHandle, removing: bool) {
        if let Some((_, no_ack)) = self.no_ack_loops.remove(&handle) {
            no_ack.reset();
        }
        let closed = self.streams.terminate_device(handle, CloseReason::Internal);
        if closed > 0 {
            tracing::debug!("Closed {} streams of {}", closed, handle);
        }
        if let Some(entry) = self.devices.get_mut(&handle) {
            entry.session.disconnected(removing);
        }
        self.listener_flags.retain(|(owner, _), _| *owner != handle);
    }

    fn command_received(&mut self, handle: DeviceHandle, buffer: BufferType, raw: Bytes) {
        match self.devices.get_mut(&handle) {
            Some(entry) => {
                self.router.dispatch(&mut entry.session, buffer, raw);
            }
            None => tracing::debug!("Command from unknown device {}", handle),
        }
    }

    fn stream_event(&mut self, id: StreamId, event: NativeStreamEvent) {
        match self.streams.get_mut(id) {
            Some(session) => session.handle_event(event),
            None => tracing::debug!("Event for unknown stream {}", id),
        }
    }

    pub fn connect(
        &mut self,
        handle: DeviceHandle,
        listener: Box<dyn DeviceListener>,
        scheduler: &mut Scheduler<ControllerState>,
    ) -> bool {
        let Some(entry) = self.devices.get_mut(&handle) else {
            tracing::warn!("Connect refused: unknown device {}", handle);
            return false;
        };
        if !entry.session.begin_connect(listener) {
            return false;
        }

        let backend = &self.backends[entry.backend];
        if let Err(e) = backend.connect(&entry.info, &self.descriptor) {
            tracing::warn!("Failed to connect to {}: {}", handle, e);
            entry.session.cancel(CancelReason::Local, false);
            return false;
        }

        let timer = scheduler.schedule(self.config.connect_timeout, move |state, _| {
            state.handshake_timed_out(handle)
        });
        entry.session.set_connect_timer(timer);
        true
    }

    fn handshake_timed_out(&mut self, handle: DeviceHandle) {
        let Some(entry) = self.devices.get_mut(&handle) else {
            return;
        };
        if entry.session.state() != ConnectionState::Connecting {
            return;
        }

        entry.session.take_connect_timer();
        tracing::warn!(
            "Connection to {} timed out after {:?}",
            handle,
            self.config.connect_timeout
        );
        if let Err(e) = self.backends[entry.backend].disconnect(handle) {
            tracing::debug!("Failed to abort connection to {}: {}", handle, e);
        }
        entry.session.cancel(CancelReason::Local, false);
    }

    pub fn disconnect(&mut self, handle: DeviceHandle, scheduler: &mut Scheduler<ControllerState>) -> bool {
        let Some(entry) = self.devices.get_mut(&handle) else {
            tracing::warn!("Disconnect refused: unknown device {}", handle);
            return false;
        };
        let backend = Arc::clone(&self.backends[entry.backend]);

        match entry.session.state() {
            ConnectionState::Connecting => {
                cancel_connect_timer(&mut entry.session, scheduler);
                if let Err(e) = backend.disconnect(handle) {
                    tracing::debug!("Failed to abort connection to {}: {}", handle, e);
                }
                entry.session.cancel(CancelReason::Local, false)
            }
            ConnectionState::Connected => {
                entry.session.begin_disconnect();
                if let Err(e) = backend.disconnect(handle) {
                    tracing::warn!("Failed to disconnect {}: {}", handle, e);
                    self.teardown(handle, false);
                }
                true
            }
            state => {
                tracing::debug!("Ignoring disconnect of {} ({})", handle, state);
                false
            }
        }
    }

    pub fn send_command(&mut self, handle: DeviceHandle, encoder: CommandEncoder) -> bool {
        let Some(entry) = self.devices.get(&handle) else {
            tracing::warn!("Dropping command for unknown device {}", handle);
            return false;
        };
        let backend = self.backends[entry.backend].as_ref();
        self.router.send(&entry.session, backend, encoder)
    }

    /// Attach a registration whose flag is already published; a refused
    /// registration is unpublished
    pub fn add_command_listener(&mut self, handle: DeviceHandle, registration: CommandRegistration) -> bool {
        let id = registration.id();
        let added = match self.devices.get_mut(&handle) {
            Some(entry) => entry.session.add_command_listener(registration),
            None => {
                tracing::debug!("Command listener refused: unknown device {}", handle);
                registration.deactivate();
                false
            }
        };
        if !added {
            self.listener_flags.remove(&(handle, id));
        }
        added
    }

    pub fn remove_command_listener(&mut self, handle: DeviceHandle, id: ListenerId) -> bool {
        self.listener_flags.remove(&(handle, id));
        self.devices
            .get_mut(&handle)
            .map(|entry| entry.session.remove_command_listener(id))
            .unwrap_or(false)
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.values().map(|entry| entry.info.clone()).collect()
    }

    pub fn snapshot(&self, handle: DeviceHandle) -> Option<SessionSnapshot> {
        self.devices.get(&handle).map(|entry| entry.session.snapshot())
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    fn connected_entry(&mut self, handle: DeviceHandle) -> Result<&mut DeviceEntry> {
        let entry = self
            .devices
            .get_mut(&handle)
            .ok_or(CoreError::UnknownDevice(handle))?;
        if !entry.session.is_connected() {
            return Err(CoreError::NotConnected(handle));
        }
        Ok(entry)
    }

    pub fn create_no_ack_loop(&mut self, handle: DeviceHandle, period: Duration) -> Result<()> {
        let index = self.connected_entry(handle)?.backend;
        let backend = Arc::clone(&self.backends[index]);
        if self.no_ack_loops.contains_key(&handle) {
            return Err(CoreError::InvalidArgument(format!(
                "no-ack loop already exists for {}",
                handle
            )));
        }

        let sender: CommandSender = Arc::new(move |command: Command| {
            log::log_command(Direction::Sent, handle, &command);
            backend.send(handle, command)
        });
        let no_ack = NoAckLoop::new(handle, period, sender)?;
        self.no_ack_loops.insert(handle, no_ack);
        Ok(())
    }

    pub fn create_tcp_proxy(&mut self, handle: DeviceHandle, device_type: i32, port: u16) -> Result<TcpProxy> {
        let index = self.connected_entry(handle)?.backend;
        let backend = Arc::clone(&self.backends[index]);
        let proxy = backend.create_tcp_proxy(handle, device_type, port)?;
        tracing::debug!("TCP proxy to {}:{} at {}", handle, port, proxy);
        Ok(proxy)
    }

    /// Transfer backend of a device that currently accepts requests
    pub fn transfer_backend(&mut self, handle: DeviceHandle) -> Result<Arc<dyn TransferBackend>> {
        let entry = self
            .devices
            .get_mut(&handle)
            .ok_or(CoreError::UnknownDevice(handle))?;
        if entry.session.requests().is_aborted() {
            return Err(CoreError::RequestsAborted(handle));
        }
        if !entry.session.is_connected() {
            return Err(CoreError::NotConnected(handle));
        }
        let backend = &self.backends[entry.backend];
        backend.transfers().ok_or(CoreError::NoTransfer {
            handle,
            backend: backend.backend_type(),
        })
    }

    pub fn track_request(&mut self, handle: DeviceHandle, request: Weak<dyn Abortable>) {
        if let Some(entry) = self.devices.get_mut(&handle) {
            entry.session.requests().track(request);
        }
    }

    pub fn open_stream(
        &mut self,
        handle: DeviceHandle,
        track: &str,
        listener: Box<dyn StreamListener>,
    ) -> Result<StreamId> {
        let index = self.connected_entry(handle)?.backend;
        let backend = Arc::clone(&self.backends[index]);

        let id = self.streams.allocate_id();
        let native = backend.create_stream(handle, id, track)?;
        let mut session = StreamSession::new(format!("{}/{}", handle, track), native, listener);
        if !session.open() {
            return Err(StreamError::Native(format!("failed to open stream '{}' on {}", track, handle)).into());
        }
        self.streams.insert(id, handle, session);
        Ok(id)
    }

    pub fn with_stream<R>(&mut self, id: StreamId, f: impl FnOnce(&mut StreamSession) -> R) -> Option<R> {
        match self.streams.get_mut(id) {
            Some(session) => Some(f(session)),
            None => {
                tracing::debug!("Unknown stream {}", id);
                None
            }
        }
    }

    pub fn start_sink<L: SinkListener>(
        &mut self,
        id: StreamId,
        media_id: u32,
        config: SinkConfig,
        listener: L,
    ) -> Result<Sink> {
        let session = self.streams.get_mut(id).ok_or(CoreError::UnknownStream(id))?;
        Ok(session.start_sink(media_id, config, listener)?)
    }

    pub fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.state(id)
    }

    /// Close a stream if needed and forget it
    pub fn release_stream(&mut self, id: StreamId) -> bool {
        match self.streams.remove(id) {
            Some(mut entry) => {
                entry.session.terminate(CloseReason::UserRequested);
                true
            }
            None => false,
        }
    }
}

fn cancel_connect_timer(session: &mut DeviceSession, scheduler: &mut Scheduler<ControllerState>) {
    if let Some(timer) = session.take_connect_timer() {
        scheduler.cancel(timer);
    }
}
