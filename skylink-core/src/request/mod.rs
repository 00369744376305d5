//! Cancellable long-running operations
//!
//! Every transfer (media, firmware update, FTP upload, crash report and
//! flight log download) is exposed as a [`Request`]: a handle that is
//! pending as soon as it is returned, may report progress zero or more times
//! and completes exactly once with one of the [`RequestStatus`] values.
//!
//! The native side drives the request through a [`RequestReporter`]. Once
//! the request is terminal (completed, cancelled or aborted) every further
//! report is discarded.

pub mod media;
pub(crate) mod registry;
pub mod transfer;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::Mutex;

pub use transfer::{CancelHook, FtpServerType, TransferBackend, TransferKind};

/// Completion status of a request.
///
/// The integer values are shared with the native peer and must not change.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
#[repr(i32)]
pub enum RequestStatus {
    Ok = 0,
    Canceled = 1,
    Failed = 2,
    Aborted = 3,
}

impl RequestStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RequestStatus::Ok),
            1 => Some(RequestStatus::Canceled),
            2 => Some(RequestStatus::Failed),
            3 => Some(RequestStatus::Aborted),
            _ => None,
        }
    }
}

/// Terminal result of a request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome<T> {
    /// Completed successfully with a value
    Ok(T),
    /// The native operation failed
    Failed(String),
    /// Cancelled by the caller
    Canceled,
    /// Aborted because the device disconnected
    Aborted,
}

impl<T> RequestOutcome<T> {
    pub fn status(&self) -> RequestStatus {
        match self {
            RequestOutcome::Ok(_) => RequestStatus::Ok,
            RequestOutcome::Failed(_) => RequestStatus::Failed,
            RequestOutcome::Canceled => RequestStatus::Canceled,
            RequestOutcome::Aborted => RequestStatus::Aborted,
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            RequestOutcome::Ok(value) => Some(value),
            _ => None,
        }
    }
}

/// Event delivered to the owner of a request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent<T, P> {
    /// Intermediate progress (0..100 or 0.0..1.0 depending on the kind)
    Progress(P),
    /// Terminal completion, delivered exactly once
    Completed(RequestOutcome<T>),
}

/// Unique identifier of a request
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Something the device teardown can force to Aborted
pub(crate) trait Abortable: Send + Sync {
    fn abort(&self) -> bool;
    fn is_pending(&self) -> bool;
}

struct RequestState<T, P> {
    status: Option<RequestStatus>,
    events: Option<mpsc::Sender<RequestEvent<T, P>>>,
    cancel_hook: Option<CancelHook>,
}

struct RequestShared<T, P> {
    id: RequestId,
    kind: TransferKind,
    state: Mutex<RequestState<T, P>>,
}

impl<T: Send, P: Send> RequestShared<T, P> {
    /// Move to a terminal state; `false` if already terminal
    fn finish(&self, outcome: RequestOutcome<T>, run_hook: bool) -> bool {
        let hook = {
            let mut state = self.state.lock();
            if state.status.is_some() {
                return false;
            }
            state.status = Some(outcome.status());
            if let Some(events) = state.events.take() {
                let _ = events.send(RequestEvent::Completed(outcome));
            }
            state.cancel_hook.take()
        };

        if run_hook {
            if let Some(hook) = hook {
                hook();
            }
        }
        true
    }
}

impl<T: Send, P: Send> Abortable for RequestShared<T, P> {
    fn abort(&self) -> bool {
        let aborted = self.finish(RequestOutcome::Aborted, true);
        if aborted {
            tracing::debug!("{} ({:?}) aborted", self.id, self.kind);
        }
        aborted
    }

    fn is_pending(&self) -> bool {
        self.state.lock().status.is_none()
    }
}

/// Caller-side handle of a long-running operation
///
/// Progress and completion are consumed on the caller's thread through
/// [`recv`](Self::recv), [`try_recv`](Self::try_recv) or
/// [`wait`](Self::wait).
pub struct Request<T, P> {
    shared: Arc<RequestShared<T, P>>,
    events: mpsc::Receiver<RequestEvent<T, P>>,
}

/// Native-side handle used to report progress and completion
pub struct RequestReporter<T, P> {
    shared: Arc<RequestShared<T, P>>,
}

/// Create a pending request and its reporter
pub fn request_pair<T, P>(kind: TransferKind) -> (Request<T, P>, RequestReporter<T, P>)
where
    T: Send + 'static,
    P: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let shared = Arc::new(RequestShared {
        id: RequestId::next(),
        kind,
        state: Mutex::new(RequestState {
            status: None,
            events: Some(tx),
            cancel_hook: None,
        }),
    });
    let reporter = RequestReporter {
        shared: Arc::clone(&shared),
    };
    (Request { shared, events: rx }, reporter)
}

impl<T, P> Request<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    pub fn id(&self) -> RequestId {
        self.shared.id
    }

    pub fn kind(&self) -> TransferKind {
        self.shared.kind
    }

    /// Terminal status, `None` while pending
    pub fn status(&self) -> Option<RequestStatus> {
        self.shared.state.lock().status
    }

    pub fn is_pending(&self) -> bool {
        self.status().is_none()
    }

    /// Cancel the request
    ///
    /// Forces `Canceled` and invokes the native cancel hook if the request
    /// is still pending. Returns `false` (and does nothing) otherwise.
    pub fn cancel(&self) -> bool {
        let canceled = self.shared.finish(RequestOutcome::Canceled, true);
        if canceled {
            tracing::debug!("{} ({:?}) canceled", self.shared.id, self.shared.kind);
        }
        canceled
    }

    /// Block until the next event; `None` once the completion was consumed
    pub fn recv(&self) -> Option<RequestEvent<T, P>> {
        self.events.recv().ok()
    }

    /// Next event if one is available
    pub fn try_recv(&self) -> Option<RequestEvent<T, P>> {
        self.events.try_recv().ok()
    }

    /// Block until the next event or the timeout expires
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RequestEvent<T, P>> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Events currently available, without blocking
    pub fn try_iter(&self) -> impl Iterator<Item = RequestEvent<T, P>> + '_ {
        self.events.try_iter()
    }

    /// Block until completion, discarding progress
    pub fn wait(self) -> RequestOutcome<T> {
        loop {
            match self.events.recv() {
                Ok(RequestEvent::Completed(outcome)) => return outcome,
                Ok(RequestEvent::Progress(_)) => continue,
                // sender dropped without completing: the reporter was lost
                Err(_) => return RequestOutcome::Failed("request abandoned".to_string()),
            }
        }
    }

    /// Block until completion or timeout, discarding progress
    ///
    /// On timeout the request is returned so the caller can keep waiting or
    /// cancel it.
    pub fn wait_timeout(self, timeout: Duration) -> Result<RequestOutcome<T>, Self> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(RequestEvent::Completed(outcome)) => return Ok(outcome),
                Ok(RequestEvent::Progress(_)) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(self),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Ok(RequestOutcome::Failed("request abandoned".to_string()))
                }
            }
        }
    }

    pub(crate) fn abortable(&self) -> std::sync::Weak<dyn Abortable> {
        let shared: Arc<dyn Abortable> = self.shared.clone();
        Arc::downgrade(&shared)
    }

    /// Attach the hook that cancels the native operation
    ///
    /// Dropped without running if the request is already terminal.
    pub(crate) fn set_cancel_hook(&self, hook: CancelHook) {
        let mut state = self.shared.state.lock();
        if state.status.is_none() {
            state.cancel_hook = Some(hook);
        }
    }
}

impl<T, P> fmt::Debug for Request<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("status", &self.shared.state.lock().status)
            .finish()
    }
}

impl<T, P> RequestReporter<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    pub fn id(&self) -> RequestId {
        self.shared.id
    }

    pub fn kind(&self) -> TransferKind {
        self.shared.kind
    }

    pub fn is_pending(&self) -> bool {
        self.shared.is_pending()
    }

    /// Report progress; discarded (returns `false`) once terminal
    pub fn progress(&self, value: P) -> bool {
        let state = self.shared.state.lock();
        if state.status.is_some() {
            tracing::trace!("Discarding late progress for {}", self.shared.id);
            return false;
        }
        match &state.events {
            Some(events) => {
                let _ = events.send(RequestEvent::Progress(value));
                true
            }
            None => false,
        }
    }

    /// Complete successfully; discarded (returns `false`) once terminal
    pub fn succeed(&self, value: T) -> bool {
        self.shared.finish(RequestOutcome::Ok(value), false)
    }

    /// Complete with a failure; discarded (returns `false`) once terminal
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        tracing::debug!("{} failed: {}", self.shared.id, reason);
        self.shared.finish(RequestOutcome::Failed(reason), false)
    }
}

impl<T, P> fmt::Debug for RequestReporter<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestReporter")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn pair() -> (Request<String, u8>, RequestReporter<String, u8>) {
        request_pair(TransferKind::DownloadMedia)
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RequestStatus::Ok.code(), 0);
        assert_eq!(RequestStatus::Canceled.code(), 1);
        assert_eq!(RequestStatus::Failed.code(), 2);
        assert_eq!(RequestStatus::Aborted.code(), 3);
        assert_eq!(RequestStatus::from_code(3), Some(RequestStatus::Aborted));
        assert_eq!(RequestStatus::from_code(4), None);
    }

    #[test]
    fn test_progress_then_completion() {
        let (request, reporter) = pair();
        assert!(request.is_pending());

        assert!(reporter.progress(10));
        assert!(reporter.progress(90));
        assert!(reporter.succeed("done".to_string()));

        let events: Vec<_> = request.try_iter().collect();
        assert_eq!(
            events,
            vec![
                RequestEvent::Progress(10),
                RequestEvent::Progress(90),
                RequestEvent::Completed(RequestOutcome::Ok("done".to_string())),
            ]
        );
        assert_eq!(request.status(), Some(RequestStatus::Ok));
    }

    #[test]
    fn test_completion_fires_once() {
        let (request, reporter) = pair();
        assert!(reporter.fail("timeout"));
        assert!(!reporter.succeed("late".to_string()));
        assert!(!reporter.progress(50));
        assert!(!request.cancel());

        assert_eq!(request.wait(), RequestOutcome::Failed("timeout".to_string()));
    }

    #[test]
    fn test_cancel_wins_over_late_success() {
        let (request, reporter) = pair();
        let hook_calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hook_calls);
        request.set_cancel_hook(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(request.cancel());
        assert!(!request.cancel());
        assert!(!reporter.succeed("late".to_string()));
        assert!(!reporter.progress(99));

        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(request.status(), Some(RequestStatus::Canceled));
        assert_eq!(request.wait(), RequestOutcome::Canceled);
    }

    #[test]
    fn test_abort_through_registry_handle() {
        let (request, reporter) = pair();
        let abortable = request.abortable();
        let abortable = abortable.upgrade().unwrap();

        assert!(abortable.is_pending());
        assert!(abortable.abort());
        assert!(!abortable.abort());
        assert!(!reporter.progress(1));
        assert_eq!(request.status(), Some(RequestStatus::Aborted));
    }

    #[test]
    fn test_hook_not_kept_after_completion() {
        let (request, reporter) = pair();
        reporter.succeed("fast".to_string());

        let hook_calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hook_calls);
        request.set_cancel_hook(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!request.cancel());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_timeout_returns_request() {
        let (request, reporter) = pair();
        let request = request.wait_timeout(Duration::from_millis(20)).unwrap_err();
        reporter.succeed("eventually".to_string());
        assert_eq!(
            request.wait_timeout(Duration::from_millis(20)).ok(),
            Some(RequestOutcome::Ok("eventually".to_string()))
        );
    }

    #[test]
    fn test_completion_from_other_thread() {
        let (request, reporter) = pair();
        let worker = std::thread::spawn(move || {
            for p in [25, 50, 75] {
                reporter.progress(p);
            }
            reporter.succeed("file.mp4".to_string());
        });

        let mut progress = Vec::new();
        let outcome = loop {
            match request.recv() {
                Some(RequestEvent::Progress(p)) => progress.push(p),
                Some(RequestEvent::Completed(outcome)) => break outcome,
                None => panic!("channel closed before completion"),
            }
        };
        worker.join().unwrap();
        assert_eq!(progress, vec![25, 50, 75]);
        assert_eq!(outcome.ok().as_deref(), Some("file.mp4"));
    }
}
