use blackboard_types::Uid;
use std::collections::HashMap;
use std::sync::Arc;

use crate::delta::{DeltaEnvelope, DeltaRecord};
use crate::object::Obj;
use crate::persistence::SessionState;
use crate::types::ViewId;

/// Saved baseline plus everything distributed since the restart
///
/// Lets a resuming session rebuild each new view to exactly the state a
/// never-restarted agent would have reached.
#[derive(Debug, Default)]
pub(crate) struct RehydrationInfo {
    baseline: Arc<Vec<Obj>>,
    pub(crate) post: Vec<Arc<DeltaEnvelope>>,
}

impl RehydrationInfo {
    pub(crate) fn new(baseline: Vec<Obj>) -> Self {
        Self {
            baseline: Arc::new(baseline),
            post: Vec::new(),
        }
    }

    /// Envelopes that fill `view` from `state`
    ///
    /// The baseline already contains the effects of the saved pending and
    /// in-flight envelopes, so those are undone first. The view is then
    /// initialized and the saved envelopes replayed in their original
    /// order, followed by everything distributed since the restart.
    pub(crate) fn fill_envelopes(&self, view: ViewId, state: &SessionState) -> Vec<DeltaEnvelope> {
        let mut order: Vec<Uid> = self.baseline.iter().map(|obj| obj.uid()).collect();
        let mut members: HashMap<Uid, Obj> = self
            .baseline
            .iter()
            .map(|obj| (obj.uid(), obj.clone()))
            .collect();

        for envelope in state.pending.iter().rev().chain(state.in_flight.iter().rev()) {
            for record in envelope.records().iter().rev() {
                match record {
                    DeltaRecord::Add(obj) => {
                        members.remove(&obj.uid());
                    }
                    DeltaRecord::Remove(obj) => {
                        if members.insert(obj.uid(), obj.clone()).is_none() {
                            order.push(obj.uid());
                        }
                    }
                    DeltaRecord::Change(..) | DeltaRecord::Bulk(_) | DeltaRecord::Event(_) => {}
                }
            }
        }

        let initial: Vec<Obj> = order
            .iter()
            .filter_map(|uid| members.remove(uid))
            .collect();

        let mut envelopes = vec![DeltaEnvelope::initialize(view, initial)];
        envelopes.extend(
            state
                .in_flight
                .iter()
                .chain(state.pending.iter())
                .chain(self.post.iter())
                .map(|envelope| DeltaEnvelope::replay(view, envelope)),
        );
        envelopes
    }

    pub(crate) fn baseline_len(&self) -> usize {
        self.baseline.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Record;
    use crate::predicate::MatchAll;
    use crate::view::{CollectionView, Subscription, View};

    fn add(obj: &Obj) -> Arc<DeltaEnvelope> {
        let mut envelope = DeltaEnvelope::new();
        envelope.add_object(obj.clone());
        Arc::new(envelope)
    }

    fn remove(obj: &Obj) -> Arc<DeltaEnvelope> {
        let mut envelope = DeltaEnvelope::new();
        envelope.remove_object(obj.clone());
        Arc::new(envelope)
    }

    fn uids(objects: &[Obj]) -> Vec<Uid> {
        let mut uids: Vec<Uid> = objects.iter().map(|o| o.uid()).collect();
        uids.sort();
        uids
    }

    #[test]
    fn test_fill_undoes_then_replays() {
        let a = Record::new("task").into_obj();
        let b = Record::new("task").into_obj();
        let c = Record::new("task").into_obj();
        // baseline after: +a (in flight), +b, -c (pending)
        let info = RehydrationInfo::new(vec![a.clone(), b.clone()]);
        let state = SessionState {
            session: "s".into(),
            pending: vec![add(&b), remove(&c)],
            in_flight: vec![add(&a)],
        };

        let view = Subscription::new(Arc::new(MatchAll), CollectionView::new());
        let envelopes = info.fill_envelopes(view.id(), &state);
        assert_eq!(envelopes.len(), 4);
        let initial: Vec<Obj> = envelopes[0].records()[0].objects().cloned().collect();
        assert_eq!(uids(&initial), uids(&[c.clone()]));

        for envelope in &envelopes {
            view.receive(envelope);
        }
        assert_eq!(uids(&view.snapshot()), uids(&[a, b]));
    }

    #[test]
    fn test_fill_is_idempotent() {
        let a = Record::new("task").into_obj();
        let b = Record::new("task").into_obj();
        let mut info = RehydrationInfo::new(vec![a.clone()]);
        info.post.push(add(&b));
        let state = SessionState {
            session: "s".into(),
            pending: vec![add(&a)],
            in_flight: vec![],
        };

        let contents = |info: &RehydrationInfo| {
            let view = Subscription::new(Arc::new(MatchAll), CollectionView::new());
            for envelope in info.fill_envelopes(view.id(), &state) {
                view.receive(&envelope);
            }
            uids(&view.snapshot())
        };
        let first = contents(&info);
        let second = contents(&info);
        assert_eq!(first, second);
        assert_eq!(first, uids(&[a, b]));
    }
}
