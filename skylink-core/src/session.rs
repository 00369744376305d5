//! Per-device connection lifecycle
//!
//! A [`DeviceSession`] exists for every known device and is only touched on
//! the controller event loop. It owns the caller's [`DeviceListener`] while a
//! connection is active and enforces the callback ordering:
//! `on_connecting`, then `on_connected`, then at most one of
//! `on_disconnected` / `on_connection_cancel`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use event_loop::TimerId;

use crate::command::Command;
use crate::device::{ApiCapabilities, DeviceHandle};
use crate::request::registry::RequestRegistry;

/// Connection state of a device session
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum ConnectionState {
    /// Known but not connected
    Idle,
    /// Handshake in progress
    Connecting,
    /// Connected, commands and requests allowed
    Connected,
    /// Disconnection requested, waiting for the backend
    Disconnecting,
    /// Last connection attempt was canceled
    Canceled,
}

impl ConnectionState {
    /// Whether a connection attempt or connection is in progress
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Why a connection attempt ended before completing.
///
/// The integer values are shared with the native peer and must not change.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
#[repr(i32)]
pub enum CancelReason {
    /// Canceled by this controller (explicit cancel or handshake timeout)
    Local = 0,
    /// Canceled by the device
    Remote = 1,
    /// The device rejected the connection
    Reject = 2,
}

impl CancelReason {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(CancelReason::Local),
            1 => Some(CancelReason::Remote),
            2 => Some(CancelReason::Reject),
            _ => None,
        }
    }
}

/// Observer of one device connection
///
/// Callbacks run on the controller event loop and must not block.
pub trait DeviceListener: Send {
    fn on_connecting(&mut self) {}

    fn on_connected(&mut self, _capabilities: ApiCapabilities) {}

    /// `removing` is true when the device also left the known set
    fn on_disconnected(&mut self, _removing: bool) {}

    fn on_connection_cancel(&mut self, _reason: CancelReason, _removing: bool) {}

    fn on_link_down(&mut self) {}

    /// A command was received; it is only borrowed for the callback
    fn on_command_received(&mut self, _command: &Command) {}
}

/// Additional receiver of a device's commands
pub trait CommandListener: Send + Sync {
    fn on_command(&self, handle: DeviceHandle, command: &Command);
}

impl<F> CommandListener for F
where
    F: Fn(DeviceHandle, &Command) + Send + Sync,
{
    fn on_command(&self, handle: DeviceHandle, command: &Command) {
        self(handle, command)
    }
}

/// Registration of a command listener
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Active flags of every command listener registration, shared between the
/// loop and caller threads
pub(crate) type ListenerFlags = dashmap::DashMap<(DeviceHandle, ListenerId), Arc<AtomicBool>>;

/// A command listener with the flag callers clear to remove it
///
/// The flag is shared with caller threads so a removal takes effect before
/// the registration itself leaves the session.
#[derive(Clone)]
pub(crate) struct CommandRegistration {
    id: ListenerId,
    listener: Arc<dyn CommandListener>,
    active: Arc<AtomicBool>,
}

impl CommandRegistration {
    pub fn new(id: ListenerId, listener: Arc<dyn CommandListener>, active: Arc<AtomicBool>) -> Self {
        Self {
            id,
            listener,
            active,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Deliver a command unless removed in the meantime
    pub fn deliver(&self, handle: DeviceHandle, command: &Command) -> bool {
        if !self.is_active() {
            return false;
        }
        self.listener.on_command(handle, command);
        true
    }
}

/// Owner of the device listener
enum ListenerSlot {
    Empty,
    Owned(Box<dyn DeviceListener>),
}

impl ListenerSlot {
    fn get(&mut self) -> Option<&mut (dyn DeviceListener + 'static)> {
        match self {
            ListenerSlot::Empty => None,
            ListenerSlot::Owned(listener) => Some(listener.as_mut()),
        }
    }

    fn release(&mut self) {
        *self = ListenerSlot::Empty;
    }
}

/// Snapshot of a session for callers outside the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub handle: DeviceHandle,
    pub state: ConnectionState,
    pub capabilities: Option<ApiCapabilities>,
    pub command_listeners: usize,
    pub pending_requests: usize,
}

/// Connection lifecycle of one device
pub struct DeviceSession {
    handle: DeviceHandle,
    state: ConnectionState,
    capabilities: Option<ApiCapabilities>,
    listener: ListenerSlot,
    command_listeners: Vec<CommandRegistration>,
    connect_timer: Option<TimerId>,
    requests: RequestRegistry,
}

impl DeviceSession {
    pub fn new(handle: DeviceHandle) -> Self {
        Self {
            handle,
            state: ConnectionState::Idle,
            capabilities: None,
            listener: ListenerSlot::Empty,
            command_listeners: Vec::new(),
            connect_timer: None,
            requests: RequestRegistry::default(),
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Capabilities reported by the last completed handshake
    pub fn capabilities(&self) -> Option<ApiCapabilities> {
        self.capabilities
    }

    /// Start connecting with `listener`
    ///
    /// Only allowed from `Idle` or `Canceled`; otherwise the listener is
    /// dropped and `false` returned.
    pub fn begin_connect(&mut self, listener: Box<dyn DeviceListener>) -> bool {
        if self.state.is_active() {
            tracing::warn!("Connect refused for {}: session is {}", self.handle, self.state);
            return false;
        }

        self.state = ConnectionState::Connecting;
        self.capabilities = None;
        self.listener = ListenerSlot::Owned(listener);
        tracing::info!("Connecting to {}", self.handle);
        if let Some(listener) = self.listener.get() {
            listener.on_connecting();
        }
        true
    }

    /// Handshake completed
    pub fn connected(&mut self, capabilities: ApiCapabilities) -> bool {
        if self.state != ConnectionState::Connecting {
            tracing::debug!("Ignoring connected for {} ({})", self.handle, self.state);
            return false;
        }

        self.state = ConnectionState::Connected;
        self.capabilities = Some(capabilities);
        self.connect_timer = None;
        self.requests.reopen();
        tracing::info!("Connected to {} ({:?})", self.handle, capabilities);
        if let Some(listener) = self.listener.get() {
            listener.on_connected(capabilities);
        }
        true
    }

    /// Connection attempt ended before completing
    pub fn cancel(&mut self, reason: CancelReason, removing: bool) -> bool {
        if self.state != ConnectionState::Connecting {
            tracing::debug!("Ignoring cancel for {} ({})", self.handle, self.state);
            return false;
        }

        self.state = ConnectionState::Canceled;
        self.connect_timer = None;
        tracing::info!("Connection to {} canceled ({:?})", self.handle, reason);
        if let Some(listener) = self.listener.get() {
            listener.on_connection_cancel(reason, removing);
        }
        self.listener.release();
        true
    }

    /// Local disconnection requested
    pub fn begin_disconnect(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            tracing::debug!("Ignoring disconnect for {} ({})", self.handle, self.state);
            return false;
        }
        self.state = ConnectionState::Disconnecting;
        true
    }

    /// The connection is gone
    ///
    /// Drops command listeners, aborts pending requests, emits
    /// `on_disconnected` and releases the listener. A disconnection during
    /// the handshake is reported as a remote cancel instead.
    pub fn disconnected(&mut self, removing: bool) -> bool {
        match self.state {
            ConnectionState::Connecting => self.cancel(CancelReason::Remote, removing),
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                self.state = ConnectionState::Idle;
                for registration in self.command_listeners.drain(..) {
                    registration.deactivate();
                }
                let aborted = self.requests.abort_all();
                tracing::info!(
                    "Disconnected from {} ({} requests aborted)",
                    self.handle,
                    aborted
                );
                if let Some(listener) = self.listener.get() {
                    listener.on_disconnected(removing);
                }
                self.listener.release();
                true
            }
            ConnectionState::Idle | ConnectionState::Canceled => {
                tracing::debug!("Ignoring disconnected for {} ({})", self.handle, self.state);
                false
            }
        }
    }

    /// The link cannot carry data for now
    pub fn link_down(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }
        tracing::warn!("Link down on {}", self.handle);
        if let Some(listener) = self.listener.get() {
            listener.on_link_down();
        }
        true
    }

    /// Register an additional command listener; only while connected
    ///
    /// A refused registration is deactivated.
    pub(crate) fn add_command_listener(&mut self, registration: CommandRegistration) -> bool {
        if !self.is_connected() || !registration.is_active() {
            tracing::debug!(
                "Command listener {} refused for {} ({})",
                registration.id(),
                self.handle,
                self.state
            );
            registration.deactivate();
            return false;
        }
        self.command_listeners.push(registration);
        true
    }

    pub fn remove_command_listener(&mut self, id: ListenerId) -> bool {
        let Some(index) = self
            .command_listeners
            .iter()
            .position(|registration| registration.id() == id)
        else {
            return false;
        };
        self.command_listeners.remove(index).deactivate();
        true
    }

    /// Command listeners in registration order
    pub(crate) fn command_listeners(&self) -> Vec<CommandRegistration> {
        self.command_listeners.clone()
    }

    pub(crate) fn device_listener(&mut self) -> Option<&mut (dyn DeviceListener + 'static)> {
        self.listener.get()
    }

    pub(crate) fn set_connect_timer(&mut self, timer: TimerId) {
        self.connect_timer = Some(timer);
    }

    pub(crate) fn take_connect_timer(&mut self) -> Option<TimerId> {
        self.connect_timer.take()
    }

    pub(crate) fn requests(&mut self) -> &mut RequestRegistry {
        &mut self.requests
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            handle: self.handle,
            state: self.state,
            capabilities: self.capabilities,
            command_listeners: self.command_listeners.len(),
            pending_requests: self.requests.pending_count(),
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("command_listeners", &self.command_listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rstest::rstest;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    impl DeviceListener for Recorder {
        fn on_connecting(&mut self) {
            self.0.lock().push("connecting".to_string());
        }

        fn on_connected(&mut self, capabilities: ApiCapabilities) {
            self.0.lock().push(format!("connected:{:?}", capabilities));
        }

        fn on_disconnected(&mut self, removing: bool) {
            self.0.lock().push(format!("disconnected:{}", removing));
        }

        fn on_connection_cancel(&mut self, reason: CancelReason, removing: bool) {
            self.0.lock().push(format!("cancel:{:?}:{}", reason, removing));
        }

        fn on_link_down(&mut self) {
            self.0.lock().push("link_down".to_string());
        }
    }

    fn session() -> (DeviceSession, Recorder) {
        let recorder = Recorder::default();
        let mut session = DeviceSession::new(DeviceHandle::new(1));
        assert!(session.begin_connect(Box::new(recorder.clone())));
        (session, recorder)
    }

    #[test]
    fn test_cancel_reason_codes() {
        assert_eq!(CancelReason::Local.code(), 0);
        assert_eq!(CancelReason::Remote.code(), 1);
        assert_eq!(CancelReason::Reject.code(), 2);
        assert_eq!(CancelReason::from_code(2), Some(CancelReason::Reject));
        assert_eq!(CancelReason::from_code(7), None);
    }

    #[test]
    fn test_connect_then_disconnect() {
        let (mut session, recorder) = session();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(session.connected(ApiCapabilities::Full));
        assert!(session.begin_disconnect());
        assert_eq!(session.state(), ConnectionState::Disconnecting);
        assert!(session.disconnected(false));
        assert_eq!(session.state(), ConnectionState::Idle);

        assert_eq!(
            recorder.events(),
            vec!["connecting", "connected:Full", "disconnected:false"]
        );
        assert!(session.device_listener().is_none());
    }

    #[rstest]
    #[case(CancelReason::Local)]
    #[case(CancelReason::Remote)]
    #[case(CancelReason::Reject)]
    fn test_cancel_releases_listener(#[case] reason: CancelReason) {
        let (mut session, recorder) = session();
        assert!(session.cancel(reason, false));
        assert_eq!(session.state(), ConnectionState::Canceled);
        assert!(session.device_listener().is_none());
        assert_eq!(
            recorder.events(),
            vec!["connecting".to_string(), format!("cancel:{:?}:false", reason)]
        );

        // terminal: no further callbacks
        assert!(!session.cancel(reason, false));
        assert!(!session.disconnected(false));
        assert_eq!(recorder.events().len(), 2);
    }

    #[test]
    fn test_connect_refused_while_active() {
        let (mut session, _recorder) = session();
        let other = Recorder::default();
        assert!(!session.begin_connect(Box::new(other.clone())));
        assert!(other.events().is_empty());

        session.connected(ApiCapabilities::Full);
        assert!(!session.begin_connect(Box::new(other.clone())));
    }

    #[test]
    fn test_reconnect_after_cancel() {
        let (mut session, _first) = session();
        session.cancel(CancelReason::Reject, false);

        let second = Recorder::default();
        assert!(session.begin_connect(Box::new(second.clone())));
        assert!(session.connected(ApiCapabilities::UpdateOnly));
        assert_eq!(second.events(), vec!["connecting", "connected:UpdateOnly"]);
    }

    #[test]
    fn test_disconnect_during_handshake_is_remote_cancel() {
        let (mut session, recorder) = session();
        assert!(session.disconnected(true));
        assert_eq!(session.state(), ConnectionState::Canceled);
        assert_eq!(recorder.events(), vec!["connecting", "cancel:Remote:true"]);
    }

    #[test]
    fn test_command_listeners_only_while_connected() {
        let (mut session, _recorder) = session();
        let listener: Arc<dyn CommandListener> = Arc::new(|_: DeviceHandle, _: &Command| {});
        let registration = || {
            CommandRegistration::new(
                ListenerId::next(),
                Arc::clone(&listener),
                Arc::new(AtomicBool::new(true)),
            )
        };

        let refused = registration();
        assert!(!session.add_command_listener(refused.clone()));
        assert!(!refused.is_active());

        session.connected(ApiCapabilities::Full);
        let first = registration();
        let second = registration();
        assert_ne!(first.id(), second.id());
        assert!(session.add_command_listener(first.clone()));
        assert!(session.add_command_listener(second.clone()));
        assert_eq!(session.command_listeners().len(), 2);

        assert!(session.remove_command_listener(first.id()));
        assert!(!session.remove_command_listener(first.id()));
        assert!(!first.is_active());

        session.disconnected(false);
        assert!(session.command_listeners().is_empty());
        assert!(!second.is_active());
        assert!(!session.add_command_listener(registration()));
    }

    #[test]
    fn test_deactivated_registration_skips_delivery() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let registration = CommandRegistration::new(
            ListenerId::next(),
            Arc::new(move |_: DeviceHandle, _: &Command| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(AtomicBool::new(true)),
        );
        let command = Command::empty();

        assert!(registration.deliver(DeviceHandle::new(1), &command));
        registration.deactivate();
        assert!(!registration.deliver(DeviceHandle::new(1), &command));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_link_down_only_when_active() {
        let mut idle = DeviceSession::new(DeviceHandle::new(2));
        assert!(!idle.link_down());

        let (mut session, recorder) = session();
        session.connected(ApiCapabilities::Full);
        assert!(session.link_down());
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(
            recorder.events(),
            vec!["connecting", "connected:Full", "link_down"]
        );
    }

    #[test]
    fn test_snapshot() {
        let (mut session, _recorder) = session();
        session.connected(ApiCapabilities::Full);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.capabilities, Some(ApiCapabilities::Full));
        assert_eq!(snapshot.pending_requests, 0);
    }
}
