//! Controller-side drone session layer
//!
//! This crate connects to devices (drones, remote controllers) reached
//! through pluggable transport backends and exposes:
//!
//! - **Device sessions**: a connection lifecycle with strictly ordered
//!   callbacks (`on_connecting` → `on_connected` → `on_disconnected` or
//!   `on_connection_cancel`)
//! - **Command routing**: encoder closures for outgoing commands, fan-out of
//!   received commands to the device listener and extra command listeners
//! - **No-ack loops**: periodic sending of piloting, gimbal and zoom
//!   commands at a fixed cadence, updatable from any thread
//! - **Requests**: cancellable media, firmware, FTP, crash report and flight
//!   log transfers that abort when the device disconnects
//! - **Streams**: video stream sessions and frame sinks from `skylink-stream`
//!
//! All session state lives on one event loop thread; every [`Controller`]
//! method can be called from any thread.
//!
//! # Quick Start
//!
//! ```rust
//! use skylink_core::prelude::*;
//! use std::time::Duration;
//!
//! let backend = LoopbackBackend::new();
//! backend.set_auto_connect(Some(ApiCapabilities::Full));
//! let drone = backend.add_device("PI040416BA8G000000", 0x090c, "ANAFI");
//!
//! let controller = Controller::builder()
//!     .config(ControllerConfig::simulation())
//!     .backend(backend.clone())
//!     .build()
//!     .unwrap();
//!
//! let (listener, events) = ChannelDeviceListener::new(drone);
//! assert!(controller.connect_device(drone, listener));
//! assert_eq!(events.recv_timeout(Duration::from_secs(1)), Some(DeviceEvent::Connecting(drone)));
//! assert_eq!(
//!     events.recv_timeout(Duration::from_secs(1)),
//!     Some(DeviceEvent::Connected(drone, ApiCapabilities::Full))
//! );
//!
//! let take_off = CommandId::new(1, 0, 1);
//! assert!(controller.send_command(drone, move |command| {
//!     command.id = take_off;
//!     Ok(())
//! }));
//! assert_eq!(backend.sent_commands()[0].1.id, take_off);
//! ```

pub mod backend;
pub mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod events;
pub mod logging;
pub mod noack;
pub mod request;
pub mod router;
pub mod session;
pub mod stream;

mod state;

pub use backend::loopback::LoopbackBackend;
pub use backend::{BackendController, BackendEventSink, ControllerDescriptor, TcpProxy};
pub use command::log::CommandLogLevel;
pub use command::{BufferType, Command, CommandEncoder, CommandId};
pub use config::ControllerConfig;
pub use controller::{Controller, ControllerBuilder, ControllerListener};
pub use device::{ApiCapabilities, BackendType, DeviceHandle, DeviceInfo};
pub use error::{BackendError, CoreError, DecodeError, EncodeError, Result};
pub use events::{ChannelDeviceListener, DeviceEvent, DeviceEvents};
pub use noack::{NoAckCommandType, NoAckLoopStats, NoAckSlot, NoAckTransition};
pub use request::{Request, RequestEvent, RequestOutcome, RequestReporter, RequestStatus};
pub use router::RouterStats;
pub use session::{
    CancelReason, CommandListener, ConnectionState, DeviceListener, ListenerId, SessionSnapshot,
};
pub use stream::StreamId;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ApiCapabilities, BufferType, CancelReason, ChannelDeviceListener, Command, CommandId,
        ConnectionState, Controller, ControllerConfig, CoreError, DeviceEvent, DeviceHandle,
        DeviceListener, LoopbackBackend, NoAckCommandType, NoAckSlot, RequestOutcome,
        RequestStatus, Result,
    };
    pub use skylink_stream::{CloseReason, SinkConfig, StreamListener, StreamState};
}
