//! Per-device set of pending requests

use std::sync::Weak;

use super::Abortable;

/// Tracks the pending requests of one device so that a disconnection can
/// force them all to Aborted
#[derive(Default)]
pub(crate) struct RequestRegistry {
    pending: Vec<Weak<dyn Abortable>>,
    aborted: bool,
}

impl RequestRegistry {
    pub fn track(&mut self, request: Weak<dyn Abortable>) {
        self.prune();
        self.pending.push(request);
    }

    /// Abort every pending request and refuse new ones until `reopen`
    pub fn abort_all(&mut self) -> usize {
        self.aborted = true;
        self.pending
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .filter(|request| request.abort())
            .count()
    }

    /// Accept requests again (the device connected)
    pub fn reopen(&mut self) {
        self.aborted = false;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|request| request.is_pending())
            .count()
    }

    fn prune(&mut self) {
        self.pending.retain(|weak| {
            weak.upgrade()
                .map(|request| request.is_pending())
                .unwrap_or(false)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{request_pair, RequestStatus, TransferKind};

    #[test]
    fn test_abort_all_pending() {
        let mut registry = RequestRegistry::default();
        let requests: Vec<_> = (0..3)
            .map(|_| request_pair::<(), u8>(TransferKind::DownloadCrashml))
            .collect();
        for (request, _) in &requests {
            registry.track(request.abortable());
        }
        assert_eq!(registry.pending_count(), 3);

        requests[0].1.succeed(());
        assert_eq!(registry.abort_all(), 2);
        assert!(registry.is_aborted());

        assert_eq!(requests[0].0.status(), Some(RequestStatus::Ok));
        assert_eq!(requests[1].0.status(), Some(RequestStatus::Aborted));
        assert_eq!(requests[2].0.status(), Some(RequestStatus::Aborted));

        registry.reopen();
        assert!(!registry.is_aborted());
    }

    #[test]
    fn test_dropped_requests_are_pruned() {
        let mut registry = RequestRegistry::default();
        {
            let (request, _reporter) = request_pair::<(), ()>(TransferKind::DeleteMedia);
            registry.track(request.abortable());
        }
        let (request, _reporter) = request_pair::<(), ()>(TransferKind::DeleteMedia);
        registry.track(request.abortable());
        assert_eq!(registry.pending.len(), 1);
    }
}
