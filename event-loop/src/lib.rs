//! Serialized Event Loop
//!
//! A single dedicated thread owning a piece of state, with work marshalled
//! onto it from any thread.
//!
//! # Features
//!
//! - **Single owner**: the state `S` is only ever touched by the loop thread
//! - **FIFO posting**: [`LoopHandle::post`] queues work in order from any thread
//! - **Synchronous calls**: [`LoopHandle::post_and_wait`] blocks for a result,
//!   failing fast instead of deadlocking when called on the loop thread
//! - **One-shot timers**: schedule and cancel delayed work through the
//!   [`Scheduler`] handed to every unit of work
//! - **Panic containment**: a panicking unit of work is logged and the loop
//!   keeps running
//!
//! # Quick Start
//!
//! ```rust
//! use event_loop::EventLoop;
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::spawn("example", Vec::<&str>::new()).unwrap();
//! let handle = event_loop.handle();
//!
//! handle.post(|log, scheduler| {
//!     log.push("posted");
//!     scheduler.schedule(Duration::from_millis(5), |log, _| log.push("timer"));
//! }).unwrap();
//!
//! std::thread::sleep(Duration::from_millis(50));
//! let log = event_loop.shutdown().unwrap();
//! assert_eq!(log, vec!["posted", "timer"]);
//! ```

mod error;
mod event_loop;
mod scheduler;

pub use error::{LoopError, Result};
pub use event_loop::{EventLoop, LoopHandle, Work};
pub use scheduler::{Scheduler, TimerId};
