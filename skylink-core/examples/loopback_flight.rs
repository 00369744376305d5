//! Simulated flight against the loopback backend
//!
//! Connects to a simulated drone, streams piloting commands through a no-ack
//! loop, sends take-off and landing, lists media and reports statistics.
//!
//! Usage: SKYLINK_LOG_MODE=development cargo run -p skylink-core --example loopback_flight

use std::sync::atomic::{AtomicI8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use skylink_core::logging::init_logging_from_env;
use skylink_core::prelude::*;

const TAKE_OFF: CommandId = CommandId::new(1, 0, 1);
const PCMD: CommandId = CommandId::new(1, 0, 2);
const LANDING: CommandId = CommandId::new(1, 0, 3);

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    println!("1. Starting controller...");
    let backend = LoopbackBackend::new();
    backend.set_auto_connect(Some(ApiCapabilities::Full));
    let drone = backend.add_device("PI040416BA8G000000", 0x0914, "ANAFI Ai");

    let controller = Controller::builder()
        .config(ControllerConfig::simulation())
        .backend(backend.clone())
        .build()?;
    for device in controller.devices() {
        println!("   found {} '{}' ({})", device.handle, device.name, device.uid);
    }

    println!("2. Connecting...");
    let (listener, events) = ChannelDeviceListener::new(drone);
    if !controller.connect_device(drone, listener) {
        return Err("connection refused".into());
    }
    for event in events.timeout_iter(Duration::from_secs(2)) {
        println!("   {:?}", event);
        if matches!(event, DeviceEvent::Connected(..)) {
            break;
        }
    }

    println!("3. Piloting...");
    controller.create_default_no_ack_loop(drone)?;
    let pitch = Arc::new(AtomicI8::new(0));
    let stick = Arc::clone(&pitch);
    controller.set_no_ack_commands(
        vec![NoAckSlot::new(NoAckCommandType::Piloting, move || {
            let pitch = stick.load(Ordering::Relaxed) as u8;
            Ok(Some(Command::new(PCMD, BufferType::NoAck, vec![1, 0, pitch, 0, 0])))
        })],
        drone,
    );

    controller.send_command(drone, |command| {
        command.id = TAKE_OFF;
        Ok(())
    });
    for value in [10, 25, 50, 25, 0] {
        pitch.store(value, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(200));
    }
    controller.send_command(drone, |command| {
        command.id = LANDING;
        Ok(())
    });
    controller.set_no_ack_commands(Vec::new(), drone);

    println!("4. Listing media...");
    let request = controller.list_media(drone)?;
    if let Some(transfers) = backend.transfer_simulator() {
        for pending in transfers.take_pending() {
            if let skylink_core::backend::loopback::PendingTransfer::ListMedia { reporter, .. } = pending {
                reporter.succeed(Vec::new());
            }
        }
    }
    match request.wait() {
        RequestOutcome::Ok(media) => println!("   {} media on the drone", media.len()),
        other => println!("   listing ended with {:?}", other.status()),
    }

    println!("5. Statistics");
    print!("{}", controller.router_stats());
    if let Some(stats) = controller.no_ack_stats(drone) {
        print!("{}", stats);
    }
    println!("   {} commands reached the backend", backend.sent_commands().len());

    controller.disconnect_device(drone);
    if let Some(event) = events.recv_timeout(Duration::from_secs(2)) {
        println!("   {:?}", event);
    }
    Ok(())
}
