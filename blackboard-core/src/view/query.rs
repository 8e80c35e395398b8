use blackboard_types::ChangeReport;

use super::{Materialized, ViewKind};
use crate::container::{Container, HashContainer};
use crate::delta::ApplyContext;
use crate::object::Obj;

/// One-shot view: keeps its initial fill and ignores everything after
#[derive(Debug, Default)]
pub struct QueryKind {
    objects: HashContainer,
    sealed: bool,
}

impl QueryKind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_objects(self) -> Vec<Obj> {
        self.objects.iter().cloned().collect()
    }
}

impl ViewKind for QueryKind {
    fn add(&mut self, obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        !self.sealed && self.objects.insert(obj.clone())
    }

    fn remove(&mut self, _obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        false
    }

    fn change(&mut self, _obj: &Obj, _reports: &[ChangeReport], _cx: &ApplyContext<'_>) -> bool {
        false
    }

    fn wakes_owner(&self) -> bool {
        false
    }

    fn filled(&mut self) {
        self.sealed = true;
    }
}

impl Materialized for QueryKind {
    type Store = HashContainer;

    fn container(&self) -> &HashContainer {
        &self.objects
    }
}
