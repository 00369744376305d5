//! Serialized event loop running on a dedicated thread
//!
//! All state of type `S` is owned by the loop thread. Other threads interact
//! with it exclusively by posting closures through a [`LoopHandle`]; the loop
//! executes them one at a time, in the order they were posted.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{LoopError, Result};
use crate::scheduler::{Scheduler, TimerId};

/// A unit of work executed on the loop thread
pub type Work<S> = Box<dyn FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static>;

enum Message<S> {
    Run(Work<S>),
    Shutdown,
}

pub(crate) struct Shared {
    name: String,
    thread_id: OnceLock<ThreadId>,
    pub(crate) next_timer_id: AtomicU64,
}

/// Cloneable, thread-safe handle used to marshal work onto the loop
pub struct LoopHandle<S> {
    tx: mpsc::Sender<Message<S>>,
    shared: Arc<Shared>,
}

impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> fmt::Debug for LoopHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.shared.name)
            .finish()
    }
}

impl<S> LoopHandle<S> {
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Name of the loop (also the name of its thread)
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the calling thread is the loop thread
    pub fn is_loop_thread(&self) -> bool {
        self.shared.thread_id.get() == Some(&thread::current().id())
    }

    /// Queue `work` for execution on the loop thread
    ///
    /// Callable from any thread, including the loop thread itself. Work is
    /// executed in FIFO order relative to all other posted work.
    pub fn post<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    {
        self.tx
            .send(Message::Run(Box::new(work)))
            .map_err(|_| LoopError::Closed(self.shared.name.clone()))
    }

    /// Queue `work` and block until it has run, returning its result
    ///
    /// Fails fast with [`LoopError::Reentrant`] when called from the loop
    /// thread, since waiting there would deadlock.
    pub fn post_and_wait<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&mut S, &mut Scheduler<S>) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_loop_thread() {
            tracing::warn!("post_and_wait refused on loop thread '{}'", self.shared.name);
            return Err(LoopError::Reentrant(self.shared.name.clone()));
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.post(move |state, scheduler| {
            let _ = reply_tx.send(work(state, scheduler));
        })?;

        reply_rx
            .recv()
            .map_err(|_| LoopError::WorkDropped(self.shared.name.clone()))
    }

    /// Run `work` on the loop once `delay` has elapsed
    ///
    /// The returned id can be cancelled from any thread with
    /// [`cancel_timer`](Self::cancel_timer) or from the loop through the
    /// [`Scheduler`].
    pub fn post_delayed<F>(&self, delay: Duration, work: F) -> Result<TimerId>
    where
        F: FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    {
        let id = self.allocate_timer_id();
        self.post(move |_, scheduler| scheduler.insert(id, delay, Box::new(work)))?;
        Ok(id)
    }

    /// Cancel a timer from any thread
    pub fn cancel_timer(&self, id: TimerId) -> Result<()> {
        self.post(move |_, scheduler| {
            scheduler.cancel(id);
        })
    }
}

/// Owner of the loop thread
///
/// Dropping the `EventLoop` stops the thread after the work currently being
/// executed; queued work and pending timers are discarded.
///
/// # Example
///
/// ```rust
/// use event_loop::EventLoop;
///
/// let event_loop = EventLoop::spawn("counter", 0u32).unwrap();
/// let handle = event_loop.handle();
///
/// handle.post(|count, _| *count += 1).unwrap();
/// let value = handle.post_and_wait(|count, _| *count).unwrap();
/// assert_eq!(value, 1);
///
/// assert_eq!(event_loop.shutdown(), Some(1));
/// ```
pub struct EventLoop<S> {
    handle: LoopHandle<S>,
    thread: Option<JoinHandle<S>>,
}

impl<S: Send + 'static> EventLoop<S> {
    /// Spawn a loop thread owning `state`
    pub fn spawn(name: impl Into<String>, state: S) -> Result<Self> {
        Self::spawn_with(name, move |_| state)
    }

    /// Spawn a loop thread whose state is built on the loop thread
    ///
    /// `init` receives a handle to the new loop, which lets the state keep
    /// its own handle (for instance to hand event sinks to collaborators).
    pub fn spawn_with<F>(name: impl Into<String>, init: F) -> Result<Self>
    where
        F: FnOnce(&LoopHandle<S>) -> S + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            name: name.clone(),
            thread_id: OnceLock::new(),
            next_timer_id: AtomicU64::new(1),
        });
        let handle = LoopHandle { tx, shared };

        let loop_handle = handle.clone();
        let thread = thread::Builder::new().name(name).spawn(move || {
            let _ = loop_handle.shared.thread_id.set(thread::current().id());
            let state = init(&loop_handle);
            run(loop_handle, rx, state)
        })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Get a handle for posting work
    pub fn handle(&self) -> LoopHandle<S> {
        self.handle.clone()
    }

    /// Stop the loop and return its state
    ///
    /// Returns `None` when the loop thread panicked outside posted work or
    /// when called from the loop thread itself.
    pub fn shutdown(mut self) -> Option<S> {
        self.stop()
    }

    fn stop(&mut self) -> Option<S> {
        let thread = self.thread.take()?;
        let _ = self.handle.tx.send(Message::Shutdown);
        if self.handle.is_loop_thread() {
            tracing::warn!(
                "Event loop '{}' dropped from its own thread, not joining",
                self.handle.name()
            );
            return None;
        }
        thread.join().ok()
    }
}

impl<S> Drop for EventLoop<S> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.tx.send(Message::Shutdown);
            if !self.handle.is_loop_thread() {
                let _ = thread.join();
            }
        }
    }
}

impl<S> fmt::Debug for EventLoop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.handle.name())
            .field("running", &self.thread.is_some())
            .finish()
    }
}

fn run<S>(handle: LoopHandle<S>, rx: mpsc::Receiver<Message<S>>, mut state: S) -> S {
    let name = handle.name().to_string();
    let mut scheduler = Scheduler::new(handle);
    tracing::info!("Event loop '{}' started", name);

    loop {
        fire_due_timers(&name, &mut state, &mut scheduler);

        let received = match scheduler.next_deadline() {
            Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Message::Run(work)) => execute(&name, "work", work, &mut state, &mut scheduler),
            Ok(Message::Shutdown) => {
                tracing::debug!("Event loop '{}' received shutdown", name);
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!("All handles to event loop '{}' dropped", name);
                break;
            }
        }
    }

    tracing::info!(
        "Event loop '{}' stopped ({} pending timers discarded)",
        name,
        scheduler.pending_count()
    );
    state
}

fn fire_due_timers<S>(name: &str, state: &mut S, scheduler: &mut Scheduler<S>) {
    let now = Instant::now();
    while let Some((id, work)) = scheduler.take_due(now) {
        tracing::trace!("Firing {} on '{}'", id, name);
        execute(name, "timer", work, state, scheduler);
    }
}

/// Run one unit of work, containing any panic at the loop boundary
fn execute<S>(name: &str, kind: &str, work: Work<S>, state: &mut S, scheduler: &mut Scheduler<S>) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(state, scheduler)));
    if let Err(payload) = outcome {
        tracing::error!(
            "Posted {} panicked on event loop '{}': {}",
            kind,
            name,
            panic_message(payload.as_ref())
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_post_runs_in_fifo_order() {
        let event_loop = EventLoop::spawn("fifo", Vec::<u32>::new()).unwrap();
        let handle = event_loop.handle();

        for i in 0..100 {
            handle.post(move |items, _| items.push(i)).unwrap();
        }

        let items = event_loop.shutdown().unwrap();
        assert_eq!(items, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_post_from_many_threads_is_serialized() {
        let event_loop = EventLoop::spawn("serial", 0u64).unwrap();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let handle = event_loop.handle();
                thread::spawn(move || {
                    for _ in 0..250 {
                        handle.post(|count, _| *count += 1).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let total = event_loop.handle().post_and_wait(|count, _| *count).unwrap();
        assert_eq!(total, 2000);
    }

    #[test]
    fn test_post_and_wait_returns_value() {
        let event_loop = EventLoop::spawn("wait", String::from("abc")).unwrap();
        let len = event_loop.handle().post_and_wait(|s, _| s.len()).unwrap();
        assert_eq!(len, 3);
    }

    #[test]
    fn test_post_and_wait_from_loop_thread_fails_fast() {
        let event_loop = EventLoop::spawn("reentrant", ()).unwrap();
        let handle = event_loop.handle();
        let inner = handle.clone();

        let result = handle
            .post_and_wait(move |_, _| inner.post_and_wait(|_, _| 42))
            .unwrap();
        assert!(matches!(result, Err(LoopError::Reentrant(_))));
    }

    #[test]
    fn test_is_loop_thread() {
        let event_loop = EventLoop::spawn("identity", ()).unwrap();
        let handle = event_loop.handle();
        assert!(!handle.is_loop_thread());

        let inner = handle.clone();
        assert!(handle.post_and_wait(move |_, _| inner.is_loop_thread()).unwrap());
    }

    #[test]
    fn test_panic_in_work_does_not_stop_loop() {
        let event_loop = EventLoop::spawn("panics", 0u32).unwrap();
        let handle = event_loop.handle();

        handle.post(|_, _| panic!("broken callback")).unwrap();
        handle.post(|count, _| *count += 1).unwrap();

        assert_eq!(handle.post_and_wait(|count, _| *count).unwrap(), 1);
    }

    #[test]
    fn test_post_and_wait_reports_dropped_work_on_panic() {
        let event_loop = EventLoop::spawn("dropped", ()).unwrap();
        let result: Result<u32> = event_loop.handle().post_and_wait(|_, _| panic!("boom"));
        assert!(matches!(result, Err(LoopError::WorkDropped(_))));
    }

    #[test]
    fn test_post_after_shutdown_is_closed() {
        let event_loop = EventLoop::spawn("closed", ()).unwrap();
        let handle = event_loop.handle();
        event_loop.shutdown();

        let result = handle.post(|_, _| {});
        assert!(matches!(result, Err(LoopError::Closed(_))));
    }

    #[test]
    fn test_timer_fires_after_delay() {
        let event_loop = EventLoop::spawn("timer", Vec::<Instant>::new()).unwrap();
        let handle = event_loop.handle();
        let start = Instant::now();

        handle
            .post_delayed(Duration::from_millis(30), |fired, _| fired.push(Instant::now()))
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        let fired = event_loop.shutdown().unwrap();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].duration_since(start) >= Duration::from_millis(30));
    }

    #[test]
    fn test_timer_cancelled_on_loop_never_fires() {
        let event_loop = EventLoop::spawn("cancel", 0u32).unwrap();
        let handle = event_loop.handle();

        let cancelled = handle
            .post_and_wait(|_, scheduler| {
                let id = scheduler.schedule(Duration::from_millis(10), |count, _| *count += 1);
                scheduler.cancel(id)
            })
            .unwrap();
        assert!(cancelled);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(event_loop.shutdown(), Some(0));
    }

    #[test]
    fn test_cancel_timer_from_other_thread() {
        let event_loop = EventLoop::spawn("remote-cancel", 0u32).unwrap();
        let handle = event_loop.handle();

        let id = handle
            .post_delayed(Duration::from_millis(50), |count, _| *count += 1)
            .unwrap();
        handle.cancel_timer(id).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(event_loop.shutdown(), Some(0));
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let event_loop = EventLoop::spawn("ordering", ()).unwrap();
        let handle = event_loop.handle();

        for (delay, tag) in [(40u64, "c"), (10, "a"), (25, "b")] {
            let order = Arc::clone(&order);
            handle
                .post_delayed(Duration::from_millis(delay), move |_, _| {
                    order.lock().unwrap().push(tag)
                })
                .unwrap();
        }

        thread::sleep(Duration::from_millis(120));
        drop(event_loop);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_spawn_with_gives_state_its_handle() {
        struct State {
            handle: LoopHandle<State>,
            hits: u32,
        }

        let event_loop = EventLoop::spawn_with("self-post", |handle| State {
            handle: handle.clone(),
            hits: 0,
        })
        .unwrap();

        event_loop
            .handle()
            .post(|state, _| {
                state.hits += 1;
                let _ = state.handle.post(|state, _| state.hits += 10);
            })
            .unwrap();

        let hits = event_loop
            .handle()
            .post_and_wait(|state, _| state.hits)
            .unwrap();
        assert_eq!(hits, 11);
    }

    #[test]
    fn test_panic_message_extraction() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "<non-string panic payload>");
    }
}
