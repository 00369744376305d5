//! Shared helpers for the integration suites

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use skylink_core::prelude::*;
use skylink_core::{ControllerListener, DeviceEvents, DeviceInfo};
use skylink_stream::{MediaInfo, PlaybackState};

pub const ANAFI: i32 = 0x0914;
pub const TIMEOUT: Duration = Duration::from_secs(2);

pub const TAKE_OFF: CommandId = CommandId::new(1, 0, 1);
pub const LANDING: CommandId = CommandId::new(1, 0, 3);
pub const PCMD: CommandId = CommandId::new(1, 0, 2);
pub const FLYING_STATE: CommandId = CommandId::new(1, 4, 1);

/// Controller over a single loopback backend with one discovered drone
pub struct Harness {
    pub controller: Controller,
    pub backend: LoopbackBackend,
    pub drone: DeviceHandle,
    pub devices: DeviceLog,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::simulation())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        Self::with_backend(LoopbackBackend::new(), config)
    }

    pub fn with_backend(backend: LoopbackBackend, config: ControllerConfig) -> Self {
        let drone = backend.add_device("PI040416BA8G000000", ANAFI, "ANAFI Ai");
        let devices = DeviceLog::default();
        let controller = Controller::builder()
            .config(config)
            .backend(backend.clone())
            .listener(devices.clone())
            .build()
            .expect("controller should start");
        Self {
            controller,
            backend,
            drone,
            devices,
        }
    }

    /// Connect the drone and consume `Connecting` and `Connected`
    pub fn connect(&self) -> DeviceEvents {
        let (listener, events) = ChannelDeviceListener::new(self.drone);
        assert!(self.controller.connect_device(self.drone, listener));
        self.backend.complete_connection(self.drone, ApiCapabilities::Full);
        expect_event(&events, DeviceEvent::Connecting(self.drone));
        expect_event(&events, DeviceEvent::Connected(self.drone, ApiCapabilities::Full));
        events
    }

    /// Wait until every event posted so far has been applied by the loop
    pub fn sync(&self) {
        self.controller.devices();
    }
}

pub fn expect_event(events: &DeviceEvents, expected: DeviceEvent) {
    assert_eq!(events.recv_timeout(TIMEOUT), Some(expected));
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

pub fn command(id: CommandId) -> Command {
    Command::new(id, BufferType::Ack, vec![])
}

/// Records device set changes
#[derive(Clone, Default)]
pub struct DeviceLog(Arc<Mutex<Vec<(bool, DeviceInfo)>>>);

impl DeviceLog {
    pub fn added(&self) -> Vec<String> {
        self.filter(true)
    }

    pub fn removed(&self) -> Vec<String> {
        self.filter(false)
    }

    fn filter(&self, added: bool) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|(kind, _)| *kind == added)
            .map(|(_, info)| info.uid.clone())
            .collect()
    }
}

impl ControllerListener for DeviceLog {
    fn on_device_added(&mut self, device: &DeviceInfo) {
        self.0.lock().push((true, device.clone()));
    }

    fn on_device_removed(&mut self, device: &DeviceInfo) {
        self.0.lock().push((false, device.clone()));
    }
}

/// Stream callback as a value
#[derive(Debug, Clone, PartialEq)]
pub enum StreamNote {
    Open,
    Closing(CloseReason),
    Closed(CloseReason),
    Playback(i64),
    MediaAdded(u32),
    MediaRemoved(u32),
}

pub struct StreamNotes(pub mpsc::Sender<StreamNote>);

impl StreamNotes {
    pub fn new() -> (Self, mpsc::Receiver<StreamNote>) {
        let (tx, rx) = mpsc::channel();
        (Self(tx), rx)
    }
}

impl StreamListener for StreamNotes {
    fn stream_did_open(&mut self) {
        let _ = self.0.send(StreamNote::Open);
    }

    fn stream_did_closing(&mut self, reason: CloseReason) {
        let _ = self.0.send(StreamNote::Closing(reason));
    }

    fn stream_did_close(&mut self, reason: CloseReason) {
        let _ = self.0.send(StreamNote::Closed(reason));
    }

    fn playback_state_did_change(&mut self, state: &PlaybackState) {
        let _ = self.0.send(StreamNote::Playback(state.position_ms));
    }

    fn media_added(&mut self, media: &MediaInfo) {
        let _ = self.0.send(StreamNote::MediaAdded(media.id));
    }

    fn media_removed(&mut self, media: &MediaInfo) {
        let _ = self.0.send(StreamNote::MediaRemoved(media.id));
    }
}
