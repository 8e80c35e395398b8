//! Persistence collaborator contract
//!
//! The core never interprets stored bytes. It hands the collaborator the
//! envelopes distributed since the last snapshot plus every session's
//! saved inbox, and asks for them back on restart.

mod memory;

pub use memory::MemoryPersistence;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::delta::DeltaEnvelope;
use crate::error::PersistenceError;
use crate::messaging::MessageManagerState;
use crate::object::Obj;

/// One session's unconsumed and last-consumed envelopes
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session: String,
    /// Delivered but not yet applied to the session's views
    pub pending: Vec<Arc<DeltaEnvelope>>,
    /// Applied by the session's most recent transaction
    pub in_flight: Vec<Arc<DeltaEnvelope>>,
}

/// Everything captured at one consistent point
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Envelopes distributed since the previous snapshot, in order
    pub epoch: Vec<Arc<DeltaEnvelope>>,
    pub sessions: Vec<SessionState>,
    pub message_state: Option<MessageManagerState>,
    /// Full store membership, present when `full` is set
    pub baseline: Option<Vec<Obj>>,
    pub full: bool,
    pub taken_at: DateTime<Utc>,
}

/// What the collaborator hands back on restart besides the baseline
#[derive(Debug, Default)]
pub struct Rehydration {
    pub message_state: Option<MessageManagerState>,
    /// Envelopes logged after the last snapshot, to be distributed again
    pub undelivered: Vec<DeltaEnvelope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceReport {
    pub sequence: u64,
    pub objects: usize,
    pub sessions: usize,
    pub full: bool,
}

pub trait Persistence: Send + Sync {
    /// Fill `out` with the saved baseline; `None` when nothing was saved
    fn rehydrate(&self, out: &mut DeltaEnvelope) -> Result<Option<Rehydration>, PersistenceError>;

    fn persist(
        &self,
        snapshot: Snapshot,
        want_result: bool,
    ) -> Result<Option<PersistenceReport>, PersistenceError>;

    /// When the next snapshot becomes due, given the last one
    fn snapshot_due(&self, last: Option<DateTime<Utc>>) -> DateTime<Utc>;

    fn subscriber_state(&self, session: &str) -> Option<SessionState>;

    fn has_subscriber_states(&self) -> bool;
}
