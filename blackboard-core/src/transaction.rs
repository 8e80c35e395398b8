//! Thread-bound transactions
//!
//! A [`Transaction`] collects change reports noted while its session has
//! a transaction open. It is bound to the opening thread in a
//! process-wide table so that code far from the session (for example
//! [`Record::set`](crate::object::Record::set)) can find it.

use blackboard_types::{ChangeReport, Uid};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::warn;

use crate::error::UsageError;
use crate::types::SessionId;

/// How often unbound table entries are swept
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

static TABLE: Lazy<DashMap<ThreadId, Option<Arc<Transaction>>>> = Lazy::new(DashMap::new);

#[derive(Debug)]
pub struct Transaction {
    session: SessionId,
    session_name: String,
    reports: Mutex<HashMap<Uid, Vec<ChangeReport>>>,
}

impl Transaction {
    pub fn new(session: SessionId, session_name: impl Into<String>) -> Self {
        Self {
            session,
            session_name: session_name.into(),
            reports: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn note(&self, uid: Uid, report: ChangeReport) {
        self.reports.lock().entry(uid).or_default().push(report);
    }

    /// Pop and clear the pending reports for one object
    pub fn take_change_reports(&self, uid: &Uid) -> Vec<ChangeReport> {
        self.reports.lock().remove(uid).unwrap_or_default()
    }

    /// Objects that have reports waiting for a `publish_change`
    pub fn pending_objects(&self) -> Vec<Uid> {
        self.reports.lock().keys().copied().collect()
    }
}

/// Bind `tx` to the calling thread
pub fn open(tx: Arc<Transaction>) -> Result<(), UsageError> {
    let mut entry = TABLE.entry(thread::current().id()).or_insert(None);
    if let Some(bound) = entry.value().as_ref() {
        return Err(UsageError::ThreadAlreadyBound {
            bound: bound.session_name.clone(),
        });
    }
    *entry.value_mut() = Some(tx);
    Ok(())
}

/// Unbind `tx` from the calling thread
pub fn close(tx: &Arc<Transaction>) -> Result<(), UsageError> {
    match TABLE.get_mut(&thread::current().id()) {
        Some(mut entry) if entry.value().as_ref().is_some_and(|bound| Arc::ptr_eq(bound, tx)) => {
            *entry.value_mut() = None;
            Ok(())
        }
        _ => Err(UsageError::TransactionNotBound {
            session: tx.session_name.clone(),
        }),
    }
}

/// Drop `tx` from whichever thread it is bound to
pub fn forget(tx: &Arc<Transaction>) {
    for mut entry in TABLE.iter_mut() {
        if entry.value().as_ref().is_some_and(|bound| Arc::ptr_eq(bound, tx)) {
            *entry.value_mut() = None;
        }
    }
}

/// Transaction bound to the calling thread
pub fn current() -> Option<Arc<Transaction>> {
    TABLE
        .get(&thread::current().id())
        .and_then(|entry| entry.value().clone())
}

/// Note a change report on the calling thread's transaction
///
/// Outside a transaction this logs and does nothing; returns whether the
/// report was recorded.
pub fn note_change_report(uid: Uid, report: ChangeReport) -> bool {
    match current() {
        Some(tx) => {
            tx.note(uid, report);
            true
        }
        None => {
            warn!(%uid, %report, "change report noted outside a transaction, ignoring");
            false
        }
    }
}

/// Combine collected and caller-supplied reports
///
/// Collected reports come first. An empty result degrades to the
/// anonymous marker.
pub fn merge_change_reports(
    collected: Vec<ChangeReport>,
    supplied: Option<Vec<ChangeReport>>,
) -> Vec<ChangeReport> {
    let mut merged = collected;
    merged.extend(supplied.unwrap_or_default());
    if merged.is_empty() {
        merged.push(ChangeReport::Anonymous);
    }
    merged
}

/// Remove entries for threads with no bound transaction
pub fn sweep() -> usize {
    let before = TABLE.len();
    TABLE.retain(|_, tx| tx.is_some());
    before.saturating_sub(TABLE.len())
}

/// Number of threads that currently have a transaction bound
pub fn bound_threads() -> usize {
    TABLE.iter().filter(|entry| entry.value().is_some()).count()
}
