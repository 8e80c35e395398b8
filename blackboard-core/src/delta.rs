//! Delta records and envelopes
//!
//! A [`DeltaEnvelope`] is the ordered log one transaction (or one bulk
//! fill) produced. Envelopes are shared as `Arc<DeltaEnvelope>` once
//! committed and never mutated again.

use blackboard_types::ChangeReport;
use chrono::{DateTime, Utc};
use std::backtrace::Backtrace;
use std::sync::Arc;

use crate::object::Obj;
use crate::types::ViewId;
use crate::view::Conditional;

/// One change to blackboard membership
#[derive(Debug, Clone)]
pub enum DeltaRecord {
    Add(Obj),
    Remove(Obj),
    Change(Obj, Vec<ChangeReport>),
    /// Initial fill or rehydration; never a "newly created" fact
    Bulk(Arc<Vec<Obj>>),
    /// Transient notification, no membership effect
    Event(Obj),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Add,
    Remove,
    Change,
    Bulk,
    Event,
}

impl DeltaRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Add(_) => RecordKind::Add,
            Self::Remove(_) => RecordKind::Remove,
            Self::Change(..) => RecordKind::Change,
            Self::Bulk(_) => RecordKind::Bulk,
            Self::Event(_) => RecordKind::Event,
        }
    }

    /// The single object this record is about, `None` for bulk records
    pub fn object(&self) -> Option<&Obj> {
        match self {
            Self::Add(obj) | Self::Remove(obj) | Self::Change(obj, _) | Self::Event(obj) => {
                Some(obj)
            }
            Self::Bulk(_) => None,
        }
    }

    /// Every object the record carries
    pub fn objects(&self) -> Box<dyn Iterator<Item = &Obj> + '_> {
        match self {
            Self::Bulk(objects) => Box::new(objects.iter()),
            other => Box::new(other.object().into_iter()),
        }
    }

    pub fn change_reports(&self) -> &[ChangeReport] {
        match self {
            Self::Change(_, reports) => reports,
            _ => &[],
        }
    }
}

/// Diagnostic stamp on envelopes from timestamping sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeStamp {
    pub session: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Which views an envelope is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeTarget {
    /// Ordinary fan-out, applied by every initialized view
    #[default]
    All,
    /// One-time fill marker for a single view
    Initialize(ViewId),
    /// Rehydration replay for a single view
    Replay(ViewId),
}

/// Per-record context handed to views while an envelope is applied
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    pub visible: bool,
    pub stamp: Option<&'a EnvelopeStamp>,
}

#[derive(Debug, Clone)]
pub struct DeltaEnvelope {
    records: Vec<DeltaRecord>,
    visible: bool,
    target: EnvelopeTarget,
    source: Option<String>,
    stamp: Option<EnvelopeStamp>,
    traces: Vec<(usize, Arc<Backtrace>)>,
}

impl Default for DeltaEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaEnvelope {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            visible: true,
            target: EnvelopeTarget::All,
            source: None,
            stamp: None,
            traces: Vec::new(),
        }
    }

    /// Envelope that updates view storage without marking views changed
    pub fn invisible() -> Self {
        Self {
            visible: false,
            ..Self::new()
        }
    }

    /// Fill marker carrying a view's initial contents
    pub fn initialize(view: ViewId, objects: Vec<Obj>) -> Self {
        let mut envelope = Self::invisible();
        envelope.target = EnvelopeTarget::Initialize(view);
        envelope.bulk_add(objects);
        envelope
    }

    /// Re-target a copy of a committed envelope at one view
    pub fn replay(view: ViewId, original: &DeltaEnvelope) -> Self {
        Self {
            records: original.records.clone(),
            visible: original.visible,
            target: EnvelopeTarget::Replay(view),
            source: original.source.clone(),
            stamp: original.stamp.clone(),
            traces: Vec::new(),
        }
    }

    pub fn add_object(&mut self, obj: Obj) -> &DeltaRecord {
        self.push(DeltaRecord::Add(obj))
    }

    pub fn remove_object(&mut self, obj: Obj) -> &DeltaRecord {
        self.push(DeltaRecord::Remove(obj))
    }

    pub fn change_object(&mut self, obj: Obj, reports: Vec<ChangeReport>) -> &DeltaRecord {
        self.push(DeltaRecord::Change(obj, reports))
    }

    /// Append a bulk record; the collection is frozen from here on
    pub fn bulk_add(&mut self, objects: Vec<Obj>) -> &DeltaRecord {
        self.push(DeltaRecord::Bulk(Arc::new(objects)))
    }

    pub fn event(&mut self, obj: Obj) -> &DeltaRecord {
        self.push(DeltaRecord::Event(obj))
    }

    fn push(&mut self, record: DeltaRecord) -> &DeltaRecord {
        self.records.push(record);
        let last = self.records.len() - 1;
        &self.records[last]
    }

    /// Attach the capture stack of the most recent record
    pub(crate) fn push_trace(&mut self, trace: Arc<Backtrace>) {
        if let Some(index) = self.records.len().checked_sub(1) {
            self.traces.push((index, trace));
        }
    }

    pub fn trace_for(&self, index: usize) -> Option<&Arc<Backtrace>> {
        self.traces
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, trace)| trace)
    }

    pub fn records(&self) -> &[DeltaRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn target(&self) -> EnvelopeTarget {
        self.target
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub(crate) fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    pub fn stamp(&self) -> Option<&EnvelopeStamp> {
        self.stamp.as_ref()
    }

    pub(crate) fn set_stamp(&mut self, stamp: EnvelopeStamp) {
        self.stamp = Some(stamp);
    }

    /// Replay every record against one view, in order
    ///
    /// Returns whether any record altered the view and the envelope is
    /// visible.
    pub fn apply_to(&self, view: &mut dyn Conditional) -> bool {
        let cx = ApplyContext {
            visible: self.visible,
            stamp: self.stamp.as_ref(),
        };
        let mut fired = false;
        for record in &self.records {
            fired |= match record {
                DeltaRecord::Add(obj) => view.conditional_add(obj, &cx),
                DeltaRecord::Remove(obj) => view.conditional_remove(obj, &cx),
                DeltaRecord::Change(obj, reports) => view.conditional_change(obj, reports, &cx),
                DeltaRecord::Bulk(objects) => objects
                    .iter()
                    .fold(false, |acc, obj| view.conditional_add(obj, &cx) | acc),
                DeltaRecord::Event(obj) => view.conditional_event(obj, &cx),
            };
        }
        fired && self.visible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Record;

    #[derive(Default)]
    struct Tally {
        adds: usize,
        removes: usize,
        changes: Vec<Vec<ChangeReport>>,
        events: usize,
    }

    impl Conditional for Tally {
        fn conditional_add(&mut self, _obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
            self.adds += 1;
            true
        }

        fn conditional_remove(&mut self, _obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
            self.removes += 1;
            true
        }

        fn conditional_change(
            &mut self,
            _obj: &Obj,
            reports: &[ChangeReport],
            _cx: &ApplyContext<'_>,
        ) -> bool {
            self.changes.push(reports.to_vec());
            true
        }

        fn conditional_event(&mut self, _obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
            self.events += 1;
            false
        }
    }

    #[test]
    fn test_append_returns_record() {
        let mut envelope = DeltaEnvelope::new();
        let record = envelope.add_object(Record::new("task").into_obj());
        assert_eq!(record.kind(), RecordKind::Add);
        let record = envelope.change_object(Record::new("task").into_obj(), vec![]);
        assert_eq!(record.kind(), RecordKind::Change);
        assert_eq!(envelope.len(), 2);
    }

    #[test]
    fn test_apply_in_order() {
        let obj = Record::new("task").into_obj();
        let mut envelope = DeltaEnvelope::new();
        envelope.add_object(obj.clone());
        envelope.change_object(obj.clone(), vec![ChangeReport::note("a")]);
        envelope.remove_object(obj.clone());
        envelope.bulk_add(vec![obj.clone(), obj.clone()]);

        let mut tally = Tally::default();
        assert!(envelope.apply_to(&mut tally));
        assert_eq!(tally.adds, 3);
        assert_eq!(tally.removes, 1);
        assert_eq!(tally.changes, vec![vec![ChangeReport::note("a")]]);
    }

    #[test]
    fn test_invisible_envelope_reports_no_change() {
        let mut envelope = DeltaEnvelope::invisible();
        envelope.add_object(Record::new("task").into_obj());
        let mut tally = Tally::default();
        assert!(!envelope.apply_to(&mut tally));
        assert_eq!(tally.adds, 1);
    }

    #[test]
    fn test_initialize_and_replay_targets() {
        let view = ViewId::new();
        let fill = DeltaEnvelope::initialize(view, vec![Record::new("task").into_obj()]);
        assert_eq!(fill.target(), EnvelopeTarget::Initialize(view));
        assert!(!fill.is_visible());
        assert_eq!(fill.records()[0].objects().count(), 1);

        let mut committed = DeltaEnvelope::new();
        committed.event(Record::new("ping").into_obj());
        let replay = DeltaEnvelope::replay(view, &committed);
        assert_eq!(replay.target(), EnvelopeTarget::Replay(view));
        assert_eq!(replay.len(), 1);
    }

    #[test]
    fn test_traces_attach_to_last_record() {
        let mut envelope = DeltaEnvelope::new();
        envelope.push_trace(Arc::new(Backtrace::disabled()));
        assert!(envelope.trace_for(0).is_none());
        envelope.add_object(Record::new("task").into_obj());
        envelope.push_trace(Arc::new(Backtrace::disabled()));
        assert!(envelope.trace_for(0).is_some());
    }
}
