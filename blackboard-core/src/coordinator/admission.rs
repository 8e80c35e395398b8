use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

/// A snapshot waiting for open transactions to drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingSnapshot {
    /// Run by whichever close drains the open count to zero
    pub(crate) lazy: bool,
    pub(crate) full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LazyRequest {
    /// Nothing is open; the caller owns the snapshot now
    RunNow,
    /// The last close will take it
    Deferred,
    AlreadyPending,
}

#[derive(Debug, Default)]
struct AdmissionState {
    open: usize,
    pending: Option<PendingSnapshot>,
    active: bool,
    last_snapshot: Option<DateTime<Utc>>,
    snapshots: u64,
}

/// Admission lock: open transaction count against snapshot flags
///
/// Never held while distributing.
#[derive(Debug, Default)]
pub(crate) struct Admission {
    state: Mutex<AdmissionState>,
    cv: Condvar,
}

impl Admission {
    /// Block while a snapshot is pending or active, then count one open
    pub(crate) fn admit(&self) {
        let mut state = self.state.lock();
        while state.pending.is_some() || state.active {
            self.cv.wait(&mut state);
        }
        state.open += 1;
    }

    pub(crate) fn try_admit(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending.is_some() || state.active {
            return false;
        }
        state.open += 1;
        true
    }

    /// Count one close; returns a lazy snapshot the caller must now run
    pub(crate) fn release(&self) -> Option<PendingSnapshot> {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
        if state.open == 0 {
            if let Some(pending) = state.pending.filter(|p| p.lazy) {
                state.pending = None;
                state.active = true;
                return Some(pending);
            }
        }
        self.cv.notify_all();
        None
    }

    /// Wait for exclusive use, drain opens, mark active
    ///
    /// Returns whether the snapshot must be full, folding in any lazy
    /// request it supersedes.
    pub(crate) fn begin_snapshot(&self, full: bool) -> bool {
        let mut state = self.state.lock();
        while state.active || state.pending.is_some_and(|p| !p.lazy) {
            self.cv.wait(&mut state);
        }
        let full = full || state.pending.is_some_and(|p| p.full);
        state.pending = Some(PendingSnapshot { lazy: false, full });
        while state.open > 0 {
            self.cv.wait(&mut state);
        }
        state.pending = None;
        state.active = true;
        full
    }

    pub(crate) fn request_lazy(&self, full: bool) -> LazyRequest {
        let mut state = self.state.lock();
        if state.active || state.pending.is_some() {
            return LazyRequest::AlreadyPending;
        }
        if state.open == 0 {
            state.active = true;
            return LazyRequest::RunNow;
        }
        state.pending = Some(PendingSnapshot { lazy: true, full });
        LazyRequest::Deferred
    }

    pub(crate) fn end_snapshot(&self, success: bool) {
        let mut state = self.state.lock();
        state.active = false;
        if success {
            state.last_snapshot = Some(Utc::now());
            state.snapshots += 1;
        }
        self.cv.notify_all();
    }

    pub(crate) fn last_snapshot(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_snapshot
    }

    pub(crate) fn snapshots(&self) -> u64 {
        self.state.lock().snapshots
    }

    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().open
    }
}
