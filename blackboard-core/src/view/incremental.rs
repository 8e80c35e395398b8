use blackboard_types::{ChangeReport, Uid};
use std::collections::HashMap;

use super::{Collection, Materialized, ViewKind};
use crate::container::{Container, HashContainer};
use crate::delta::ApplyContext;
use crate::object::Obj;

/// Collection that also remembers what changed since the last reset
///
/// Only visible envelopes are tracked, so fills and rehydration do not
/// show up as adds.
#[derive(Debug, Default)]
pub struct Incremental<C> {
    collection: Collection<C>,
    added: HashMap<Uid, Obj>,
    removed: HashMap<Uid, Obj>,
    changed: HashMap<Uid, (Obj, Vec<ChangeReport>)>,
}

pub type IncrementalView = Incremental<HashContainer>;

impl<C: Container + Default> Incremental<C> {
    pub fn new() -> Self {
        Self::from_collection(Collection::new())
    }

    pub fn dynamic() -> Self {
        Self::from_collection(Collection::dynamic())
    }
}

impl<C: Container> Incremental<C> {
    pub fn from_collection(collection: Collection<C>) -> Self {
        Self {
            collection,
            added: HashMap::new(),
            removed: HashMap::new(),
            changed: HashMap::new(),
        }
    }

    pub fn added(&self) -> Vec<Obj> {
        self.added.values().cloned().collect()
    }

    pub fn removed(&self) -> Vec<Obj> {
        self.removed.values().cloned().collect()
    }

    pub fn changed(&self) -> Vec<Obj> {
        self.changed.values().map(|(obj, _)| obj.clone()).collect()
    }

    pub fn was_added(&self, uid: &Uid) -> bool {
        self.added.contains_key(uid)
    }

    pub fn was_removed(&self, uid: &Uid) -> bool {
        self.removed.contains_key(uid)
    }

    /// Reports accumulated for `uid`, empty if it did not change
    pub fn change_reports(&self, uid: &Uid) -> Vec<ChangeReport> {
        self.changed
            .get(uid)
            .map(|(_, reports)| reports.clone())
            .unwrap_or_default()
    }
}

impl<C: Container> ViewKind for Incremental<C> {
    fn add(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool {
        let fired = self.collection.add(obj, cx);
        if fired && cx.visible {
            let uid = obj.uid();
            if self.removed.remove(&uid).is_some() {
                self.changed
                    .entry(uid)
                    .or_insert_with(|| (obj.clone(), Vec::new()))
                    .1
                    .push(ChangeReport::Anonymous);
            } else {
                self.added.insert(uid, obj.clone());
            }
        }
        fired
    }

    fn remove(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool {
        let fired = self.collection.remove(obj, cx);
        if fired && cx.visible {
            let uid = obj.uid();
            self.changed.remove(&uid);
            if self.added.remove(&uid).is_none() {
                self.removed.insert(uid, obj.clone());
            }
        }
        fired
    }

    fn change(&mut self, obj: &Obj, reports: &[ChangeReport], cx: &ApplyContext<'_>) -> bool {
        let fired = self.collection.change(obj, reports, cx);
        if fired && cx.visible && !self.added.contains_key(&obj.uid()) {
            self.changed
                .entry(obj.uid())
                .or_insert_with(|| (obj.clone(), Vec::new()))
                .1
                .extend_from_slice(reports);
        }
        fired
    }

    fn reset(&mut self) {
        self.added.clear();
        self.removed.clear();
        self.changed.clear();
    }

    fn dynamic_membership(&self, uid: &Uid) -> Option<bool> {
        self.collection.dynamic_membership(uid)
    }
}

impl<C: Container> Materialized for Incremental<C> {
    type Store = C;

    fn container(&self) -> &C {
        self.collection.container()
    }
}
