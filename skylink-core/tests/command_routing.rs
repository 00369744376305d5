//! Command sending and received-command fan-out

mod common;

use std::sync::mpsc;
use std::sync::Arc;

use bytes::Bytes;
use common::*;
use mockall::mock;
use parking_lot::Mutex;
use skylink_core::prelude::*;
use skylink_core::{
    BackendController, BackendError, BackendEventSink, BackendType, ControllerDescriptor,
    DeviceInfo, EncodeError, ListenerId, RouterStats,
};

#[test]
fn test_send_requires_connection() {
    let harness = Harness::new();
    let take_off = |command: &mut Command| -> std::result::Result<(), EncodeError> {
        command.id = TAKE_OFF;
        Ok(())
    };

    assert!(!harness.controller.send_command(harness.drone, take_off));
    let events = harness.connect();
    assert!(harness.controller.send_command(harness.drone, take_off));

    harness.controller.disconnect_device(harness.drone);
    expect_event(
        &events,
        DeviceEvent::Disconnected {
            handle: harness.drone,
            removing: false,
        },
    );
    assert!(!harness.controller.send_command(harness.drone, take_off));

    assert_eq!(harness.backend.sent_commands(), vec![(harness.drone, command(TAKE_OFF))]);
    let stats = harness.controller.router_stats();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.dropped, 2);
}

#[test]
fn test_encoder_failure_sends_nothing() {
    let harness = Harness::new();
    let _events = harness.connect();

    let sent = harness.controller.send_command(harness.drone, |command| {
        command.id = PCMD;
        command.set_payload(vec![0u8; 64 * 1024])
    });
    assert!(!sent);
    let refused = harness.controller.send_command(harness.drone, |_| {
        Err(EncodeError::InvalidArgument("roll out of range".to_string()))
    });
    assert!(!refused);

    assert!(harness.backend.sent_commands().is_empty());
    assert_eq!(harness.controller.router_stats().encode_errors, 2);
}

#[test]
fn test_buffer_chosen_by_encoder() {
    let harness = Harness::new();
    let _events = harness.connect();

    assert!(harness.controller.send_command(harness.drone, |command| {
        command.id = LANDING;
        command.buffer = BufferType::HighPriority;
        command.set_payload(vec![1, 2, 3])
    }));

    let sent = harness.backend.take_sent();
    assert_eq!(
        sent,
        vec![(
            harness.drone,
            Command::new(LANDING, BufferType::HighPriority, vec![1, 2, 3])
        )]
    );
}

#[test]
fn test_received_command_reaches_device_listener_then_command_listeners() {
    let harness = Harness::new();
    let events = harness.connect();

    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let order = Arc::clone(&order);
        let id = harness.controller.add_command_listener(
            harness.drone,
            move |_: DeviceHandle, command: &Command| order.lock().push((name, command.id)),
        );
        assert!(id.is_some());
    }

    let state = Command::new(FLYING_STATE, BufferType::Ack, vec![2, 0, 0, 0]);
    harness.backend.inject_command(harness.drone, &state);

    expect_event(&events, DeviceEvent::CommandReceived(harness.drone, state.clone()));
    assert!(wait_until(|| order.lock().len() == 2));
    assert_eq!(
        *order.lock(),
        vec![("first", FLYING_STATE), ("second", FLYING_STATE)]
    );
    assert_eq!(harness.controller.router_stats().received, 1);
}

#[test]
fn test_removed_command_listener_stops_receiving() {
    let harness = Harness::new();
    let events = harness.connect();

    let count = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&count);
    let id = harness
        .controller
        .add_command_listener(harness.drone, move |_: DeviceHandle, _: &Command| {
            *counter.lock() += 1;
        })
        .unwrap();

    harness.backend.inject_command(harness.drone, &command(FLYING_STATE));
    expect_event(&events, DeviceEvent::CommandReceived(harness.drone, command(FLYING_STATE)));
    assert!(harness.controller.remove_command_listener(harness.drone, id));
    assert!(!harness.controller.remove_command_listener(harness.drone, id));

    harness.backend.inject_command(harness.drone, &command(FLYING_STATE));
    expect_event(&events, DeviceEvent::CommandReceived(harness.drone, command(FLYING_STATE)));
    assert_eq!(*count.lock(), 1);
}

#[test]
fn test_command_listener_refused_unless_connected() {
    let harness = Harness::new();
    let listener = |_: DeviceHandle, _: &Command| {};
    assert_eq!(harness.controller.add_command_listener(harness.drone, listener), None);
    assert_eq!(
        harness.controller.add_command_listener(DeviceHandle::new(99), listener),
        None
    );
}

#[test]
fn test_command_listeners_dropped_on_disconnect() {
    let harness = Harness::new();
    let events = harness.connect();
    harness
        .controller
        .add_command_listener(harness.drone, |_: DeviceHandle, _: &Command| {})
        .unwrap();
    assert_eq!(harness.controller.session(harness.drone).unwrap().command_listeners, 1);

    harness.controller.disconnect_device(harness.drone);
    expect_event(
        &events,
        DeviceEvent::Disconnected {
            handle: harness.drone,
            removing: false,
        },
    );
    let _events = harness.connect();
    assert_eq!(harness.controller.session(harness.drone).unwrap().command_listeners, 0);
}

#[test]
fn test_received_while_disconnected_is_dropped() {
    let harness = Harness::new();
    harness.backend.inject_command(harness.drone, &command(FLYING_STATE));
    harness.sync();

    let stats = harness.controller.router_stats();
    assert_eq!(stats.received, 0);
    assert_eq!(stats.dropped, 1);
}

#[test]
fn test_undecodable_bytes_are_counted() {
    let harness = Harness::new();
    let events = harness.connect();

    harness
        .backend
        .inject_raw(harness.drone, BufferType::Ack, Bytes::from_static(&[1, 4]));
    harness.sync();
    assert_eq!(events.try_recv(), None);
    assert_eq!(harness.controller.router_stats().decode_errors, 1);
}

#[test]
fn test_failed_send_is_counted() {
    let harness = Harness::new();
    let _events = harness.connect();
    harness.backend.set_fail_sends(true);

    assert!(!harness.controller.send_command(harness.drone, |command| {
        command.id = TAKE_OFF;
        Ok(())
    }));
    assert_eq!(
        harness.controller.router_stats(),
        RouterStats {
            send_errors: 1,
            ..Default::default()
        }
    );
}

#[test]
fn test_command_from_device_callback() {
    // a listener sending a command from its own callback
    struct Echo {
        controller: Arc<Mutex<Option<Arc<Controller>>>>,
        handle: DeviceHandle,
    }

    impl DeviceListener for Echo {
        fn on_command_received(&mut self, command: &Command) {
            let reply = command.id;
            if let Some(controller) = self.controller.lock().as_ref() {
                assert!(controller.send_command(self.handle, move |out| {
                    out.id = reply;
                    Ok(())
                }));
            }
        }
    }

    let backend = LoopbackBackend::new();
    backend.set_auto_connect(Some(ApiCapabilities::Full));
    let drone = backend.add_device("ECHO", ANAFI, "echo");
    let controller = Arc::new(
        Controller::builder()
            .config(ControllerConfig::simulation())
            .backend(backend.clone())
            .build()
            .unwrap(),
    );
    let slot = Arc::new(Mutex::new(Some(Arc::clone(&controller))));
    let echo = Echo {
        controller: Arc::clone(&slot),
        handle: drone,
    };

    assert!(controller.connect_device(drone, echo));
    assert!(wait_until(|| controller.connection_state(drone) == Some(ConnectionState::Connected)));
    backend.inject_command(drone, &command(FLYING_STATE));
    assert!(wait_until(|| !backend.sent_commands().is_empty()));
    assert_eq!(backend.sent_commands()[0].1.id, FLYING_STATE);

    // break the cycle before dropping the controller
    slot.lock().take();
}

#[test]
fn test_command_listener_registered_from_on_connected() {
    struct Registering {
        controller: Arc<Mutex<Option<Arc<Controller>>>>,
        handle: DeviceHandle,
        seen: Arc<Mutex<Vec<CommandId>>>,
        registered: mpsc::Sender<Option<ListenerId>>,
    }

    impl DeviceListener for Registering {
        fn on_connected(&mut self, _capabilities: ApiCapabilities) {
            let seen = Arc::clone(&self.seen);
            let id = self.controller.lock().as_ref().and_then(|controller| {
                controller.add_command_listener(self.handle, move |_: DeviceHandle, command: &Command| {
                    seen.lock().push(command.id)
                })
            });
            let _ = self.registered.send(id);
        }
    }

    let backend = LoopbackBackend::new();
    backend.set_auto_connect(Some(ApiCapabilities::Full));
    let drone = backend.add_device("REGISTER", ANAFI, "register");
    let controller = Arc::new(
        Controller::builder()
            .config(ControllerConfig::simulation())
            .backend(backend.clone())
            .build()
            .unwrap(),
    );
    let slot = Arc::new(Mutex::new(Some(Arc::clone(&controller))));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (tx, registered) = mpsc::channel();

    assert!(controller.connect_device(
        drone,
        Registering {
            controller: Arc::clone(&slot),
            handle: drone,
            seen: Arc::clone(&seen),
            registered: tx,
        }
    ));
    let id = registered.recv_timeout(TIMEOUT).unwrap();
    assert!(id.is_some());
    assert_eq!(controller.session(drone).unwrap().command_listeners, 1);

    backend.inject_command(drone, &command(FLYING_STATE));
    assert!(wait_until(|| seen.lock().len() == 1));
    assert_eq!(*seen.lock(), vec![FLYING_STATE]);
    assert!(controller.remove_command_listener(drone, id.unwrap()));

    slot.lock().take();
}

#[test]
fn test_command_listener_removing_itself_stops_at_once() {
    let backend = LoopbackBackend::new();
    let drone = backend.add_device("SELF", ANAFI, "self");
    let controller = Arc::new(
        Controller::builder()
            .config(ControllerConfig::simulation())
            .backend(backend.clone())
            .build()
            .unwrap(),
    );
    let (listener, events) = ChannelDeviceListener::new(drone);
    assert!(controller.connect_device(drone, listener));
    backend.complete_connection(drone, ApiCapabilities::Full);
    expect_event(&events, DeviceEvent::Connecting(drone));
    expect_event(&events, DeviceEvent::Connected(drone, ApiCapabilities::Full));

    let slot = Arc::new(Mutex::new(Some(Arc::clone(&controller))));
    let own_id: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
    let removals = Arc::new(Mutex::new(Vec::new()));

    let (controller_slot, id_slot, results) = (Arc::clone(&slot), Arc::clone(&own_id), Arc::clone(&removals));
    let id = controller
        .add_command_listener(drone, move |handle: DeviceHandle, _: &Command| {
            let id = (*id_slot.lock()).expect("id is set before commands arrive");
            if let Some(controller) = controller_slot.lock().as_ref() {
                results.lock().push(controller.remove_command_listener(handle, id));
            }
        })
        .unwrap();
    *own_id.lock() = Some(id);

    // both commands are queued on the loop before the first delivery
    backend.inject_command(drone, &command(FLYING_STATE));
    backend.inject_command(drone, &command(FLYING_STATE));
    expect_event(&events, DeviceEvent::CommandReceived(drone, command(FLYING_STATE)));
    expect_event(&events, DeviceEvent::CommandReceived(drone, command(FLYING_STATE)));
    controller.devices();

    assert_eq!(*removals.lock(), vec![true]);
    assert!(!controller.remove_command_listener(drone, id));
    assert_eq!(controller.session(drone).unwrap().command_listeners, 0);

    slot.lock().take();
}

mock! {
    Transport {}

    impl BackendController for Transport {
        fn backend_type(&self) -> BackendType;
        fn start(&self, events: BackendEventSink) -> std::result::Result<(), BackendError>;
        fn stop(&self);
        fn connect(&self, device: &DeviceInfo, descriptor: &ControllerDescriptor) -> std::result::Result<(), BackendError>;
        fn disconnect(&self, handle: DeviceHandle) -> std::result::Result<(), BackendError>;
        fn send(&self, handle: DeviceHandle, command: Command) -> std::result::Result<(), BackendError>;
    }
}

#[test]
fn test_custom_backend_contract() {
    let sink: Arc<Mutex<Option<BackendEventSink>>> = Arc::new(Mutex::new(None));
    let drone = DeviceHandle::new(7);

    let mut transport = MockTransport::new();
    transport.expect_backend_type().return_const(BackendType::Net);
    let captured = Arc::clone(&sink);
    transport.expect_start().times(1).returning(move |events| {
        *captured.lock() = Some(events);
        Ok(())
    });
    transport
        .expect_connect()
        .withf(|device: &DeviceInfo, descriptor: &ControllerDescriptor| {
            device.uid == "MOCK" && descriptor.name == "skylink"
        })
        .times(1)
        .returning(|_, _| Ok(()));
    transport.expect_send().returning(|handle, _| {
        Err(BackendError::SendFailed {
            handle,
            reason: "link saturated".to_string(),
        })
    });
    transport.expect_stop().times(1).return_const(());

    let controller = Controller::builder()
        .config(ControllerConfig::simulation())
        .backend(transport)
        .build()
        .unwrap();
    let events = sink.lock().clone().unwrap();
    events.device_added(DeviceInfo {
        uid: "MOCK".to_string(),
        device_type: ANAFI,
        backend_type: BackendType::Net,
        name: "mock".to_string(),
        handle: drone,
    });

    let (listener, device_events) = ChannelDeviceListener::new(drone);
    assert!(controller.connect_device(drone, listener));
    events.connected(drone, ApiCapabilities::Full);
    expect_event(&device_events, DeviceEvent::Connecting(drone));
    expect_event(&device_events, DeviceEvent::Connected(drone, ApiCapabilities::Full));

    assert!(!controller.send_command(drone, |command| {
        command.id = TAKE_OFF;
        Ok(())
    }));
    assert_eq!(controller.router_stats().send_errors, 1);

    assert!(matches!(
        controller.create_tcp_proxy(drone, ANAFI, 80),
        Err(CoreError::Backend(BackendError::Unsupported(_)))
    ));
    assert!(matches!(
        controller.list_media(drone),
        Err(CoreError::NoTransfer {
            backend: BackendType::Net,
            ..
        })
    ));
}
