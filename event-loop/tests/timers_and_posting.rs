//! Integration tests for posting work and scheduling timers across threads

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use event_loop::{EventLoop, LoopError};
use rstest::rstest;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("event_loop=trace")
        .try_init();
}

#[derive(Default)]
struct Recorder {
    events: Vec<String>,
}

/// Timers of varying delays all fire, and none before its delay
#[rstest]
#[case(0)]
#[case(5)]
#[case(25)]
fn test_timer_respects_delay(#[case] delay_ms: u64) {
    init_tracing();
    let event_loop = EventLoop::spawn("delay", Recorder::default()).unwrap();
    let (tx, rx) = mpsc::channel();
    let start = Instant::now();

    event_loop
        .handle()
        .post_delayed(Duration::from_millis(delay_ms), move |recorder, _| {
            recorder.events.push("fired".into());
            let _ = tx.send(Instant::now());
        })
        .unwrap();

    let fired_at = rx.recv_timeout(Duration::from_secs(2)).expect("timer never fired");
    assert!(fired_at.duration_since(start) >= Duration::from_millis(delay_ms));
    assert_eq!(event_loop.shutdown().unwrap().events, vec!["fired"]);
}

#[test]
fn test_timer_can_reschedule_itself() {
    init_tracing();
    let event_loop = EventLoop::spawn("repeat", 0u32).unwrap();
    let (tx, rx) = mpsc::channel();

    fn tick(count: &mut u32, scheduler: &mut event_loop::Scheduler<u32>, tx: mpsc::Sender<u32>) {
        *count += 1;
        if *count < 3 {
            scheduler.schedule(Duration::from_millis(5), move |count, scheduler| {
                tick(count, scheduler, tx)
            });
        } else {
            let _ = tx.send(*count);
        }
    }

    event_loop
        .handle()
        .post(move |count, scheduler| tick(count, scheduler, tx))
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 3);
}

#[test]
fn test_posted_work_interleaves_with_pending_timer() {
    init_tracing();
    let event_loop = EventLoop::spawn("interleave", Recorder::default()).unwrap();
    let handle = event_loop.handle();

    handle
        .post_delayed(Duration::from_millis(40), |recorder, _| {
            recorder.events.push("timer".into())
        })
        .unwrap();
    handle
        .post(|recorder, _| recorder.events.push("immediate".into()))
        .unwrap();

    thread::sleep(Duration::from_millis(120));
    let recorder = event_loop.shutdown().unwrap();
    assert_eq!(recorder.events, vec!["immediate", "timer"]);
}

#[test]
fn test_pending_timers_are_discarded_on_shutdown() {
    init_tracing();
    let event_loop = EventLoop::spawn("discard", Recorder::default()).unwrap();
    event_loop
        .handle()
        .post_delayed(Duration::from_secs(60), |recorder, _| {
            recorder.events.push("late".into())
        })
        .unwrap();

    let recorder = event_loop.shutdown().unwrap();
    assert!(recorder.events.is_empty());
}

#[test]
fn test_handles_outlive_loop() {
    init_tracing();
    let handle = {
        let event_loop = EventLoop::spawn("short-lived", ()).unwrap();
        event_loop.handle()
    };

    assert!(matches!(handle.post(|_, _| {}), Err(LoopError::Closed(_))));
    assert!(matches!(
        handle.post_and_wait(|_, _| 1),
        Err(LoopError::Closed(_))
    ));
}

#[test]
fn test_loop_thread_carries_loop_name() {
    let event_loop = EventLoop::spawn("skylink-test-loop", ()).unwrap();
    let name = event_loop
        .handle()
        .post_and_wait(|_, _| thread::current().name().map(str::to_string))
        .unwrap();
    assert_eq!(name.as_deref(), Some("skylink-test-loop"));
}
