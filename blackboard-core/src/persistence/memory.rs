use blackboard_types::Uid;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration as StdDuration;
use tracing::{debug, info};

use super::{Persistence, PersistenceReport, Rehydration, SessionState, Snapshot};
use crate::delta::{DeltaEnvelope, DeltaRecord};
use crate::error::PersistenceError;
use crate::messaging::MessageManagerState;
use crate::object::Obj;

#[derive(Debug, Default)]
struct Saved {
    objects: BTreeMap<Uid, Obj>,
    sessions: HashMap<String, SessionState>,
    message_state: Option<MessageManagerState>,
    undelivered: Vec<DeltaEnvelope>,
    sequence: u64,
}

/// Process-local persistence, shared between coordinator generations
///
/// Keeps the object baseline by replaying each snapshot's epoch. Useful
/// for tests and simulations of a restart.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    saved: Mutex<Saved>,
    min_interval: StdDuration,
    fail_next: Mutex<Option<String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only report a snapshot as due this long after the previous one
    pub fn with_min_interval(mut self, interval: StdDuration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Make the next `persist` call fail with `reason`
    pub fn fail_next(&self, reason: impl Into<String>) {
        *self.fail_next.lock() = Some(reason.into());
    }

    /// Stage envelopes as if logged after the last snapshot
    pub fn stage_undelivered(&self, envelope: DeltaEnvelope) {
        self.saved.lock().undelivered.push(envelope);
    }

    pub fn sequence(&self) -> u64 {
        self.saved.lock().sequence
    }

    pub fn object_count(&self) -> usize {
        self.saved.lock().objects.len()
    }

    pub fn saved_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.saved.lock().sessions.keys().cloned().collect();
        names.sort();
        names
    }
}

fn replay(objects: &mut BTreeMap<Uid, Obj>, envelope: &DeltaEnvelope) {
    for record in envelope.records() {
        match record {
            DeltaRecord::Add(obj) => {
                objects.insert(obj.uid(), obj.clone());
            }
            DeltaRecord::Remove(obj) => {
                objects.remove(&obj.uid());
            }
            DeltaRecord::Bulk(bulk) => {
                for obj in bulk.iter() {
                    objects.insert(obj.uid(), obj.clone());
                }
            }
            DeltaRecord::Change(..) | DeltaRecord::Event(_) => {}
        }
    }
}

impl Persistence for MemoryPersistence {
    fn rehydrate(&self, out: &mut DeltaEnvelope) -> Result<Option<Rehydration>, PersistenceError> {
        let mut saved = self.saved.lock();
        if saved.sequence == 0 && saved.undelivered.is_empty() {
            return Ok(None);
        }
        out.bulk_add(saved.objects.values().cloned().collect());
        info!(
            objects = saved.objects.len(),
            sessions = saved.sessions.len(),
            sequence = saved.sequence,
            "rehydrating from memory"
        );
        Ok(Some(Rehydration {
            message_state: saved.message_state.clone(),
            undelivered: std::mem::take(&mut saved.undelivered),
        }))
    }

    fn persist(
        &self,
        snapshot: Snapshot,
        want_result: bool,
    ) -> Result<Option<PersistenceReport>, PersistenceError> {
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(PersistenceError::WriteFailed(reason));
        }
        let mut saved = self.saved.lock();
        match snapshot.baseline {
            Some(baseline) => {
                saved.objects = baseline.into_iter().map(|obj| (obj.uid(), obj)).collect();
            }
            None => {
                for envelope in &snapshot.epoch {
                    replay(&mut saved.objects, envelope);
                }
            }
        }
        saved.sessions = snapshot
            .sessions
            .into_iter()
            .map(|state| (state.session.clone(), state))
            .collect();
        saved.message_state = snapshot.message_state;
        saved.undelivered.clear();
        saved.sequence += 1;
        debug!(
            sequence = saved.sequence,
            epoch = snapshot.epoch.len(),
            full = snapshot.full,
            "snapshot persisted"
        );
        Ok(want_result.then(|| PersistenceReport {
            sequence: saved.sequence,
            objects: saved.objects.len(),
            sessions: saved.sessions.len(),
            full: snapshot.full,
        }))
    }

    fn snapshot_due(&self, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
        match last {
            Some(last) => Duration::from_std(self.min_interval)
                .ok()
                .and_then(|interval| last.checked_add_signed(interval))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            None => Utc::now(),
        }
    }

    fn subscriber_state(&self, session: &str) -> Option<SessionState> {
        self.saved.lock().sessions.get(session).cloned()
    }

    fn has_subscriber_states(&self) -> bool {
        !self.saved.lock().sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Record;
    use std::sync::Arc;

    fn snapshot(epoch: Vec<Arc<DeltaEnvelope>>) -> Snapshot {
        Snapshot {
            epoch,
            sessions: vec![],
            message_state: None,
            baseline: None,
            full: false,
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn test_nothing_saved_rehydrates_none() {
        let persistence = MemoryPersistence::new();
        let mut out = DeltaEnvelope::invisible();
        assert!(persistence.rehydrate(&mut out).unwrap().is_none());
        assert!(out.is_empty());
    }

    #[test]
    fn test_epochs_accumulate_into_baseline() {
        let persistence = MemoryPersistence::new();
        let x = Record::new("task").into_obj();
        let y = Record::new("task").into_obj();
        let mut first = DeltaEnvelope::new();
        first.add_object(x.clone());
        first.add_object(y.clone());
        let report = persistence
            .persist(snapshot(vec![Arc::new(first)]), true)
            .unwrap()
            .unwrap();
        assert_eq!(report.objects, 2);

        let mut second = DeltaEnvelope::new();
        second.remove_object(x.clone());
        assert!(persistence
            .persist(snapshot(vec![Arc::new(second)]), false)
            .unwrap()
            .is_none());

        let mut out = DeltaEnvelope::invisible();
        persistence.rehydrate(&mut out).unwrap().unwrap();
        let objects: Vec<_> = out.records()[0].objects().map(|o| o.uid()).collect();
        assert_eq!(objects, vec![y.uid()]);
    }

    #[test]
    fn test_fail_next_then_recover() {
        let persistence = MemoryPersistence::new();
        persistence.fail_next("disk full");
        assert_eq!(
            persistence.persist(snapshot(vec![]), true),
            Err(PersistenceError::WriteFailed("disk full".into()))
        );
        assert!(persistence.persist(snapshot(vec![]), true).unwrap().is_some());
        assert_eq!(persistence.sequence(), 1);
    }

    #[test]
    fn test_snapshot_due_respects_min_interval() {
        let persistence = MemoryPersistence::new().with_min_interval(StdDuration::from_secs(60));
        let now = Utc::now();
        assert!(persistence.snapshot_due(None) <= Utc::now());
        assert!(persistence.snapshot_due(Some(now)) > Utc::now());
    }
}
