use blackboard_types::ChangeReport;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::{Materialized, ViewKind};
use crate::container::{Container, ListContainer};
use crate::delta::ApplyContext;
use crate::object::Obj;

pub type Comparator = Arc<dyn Fn(&Obj, &Obj) -> Ordering + Send + Sync>;

/// Ordered view, re-sorted lazily before it is read
pub struct Sorted {
    list: ListContainer,
    compare: Comparator,
    dirty: bool,
}

impl Sorted {
    pub fn new<F>(compare: F) -> Self
    where
        F: Fn(&Obj, &Obj) -> Ordering + Send + Sync + 'static,
    {
        Self {
            list: ListContainer::new(),
            compare: Arc::new(compare),
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl fmt::Debug for Sorted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sorted")
            .field("len", &self.list.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl ViewKind for Sorted {
    fn add(&mut self, obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        let fired = self.list.insert(obj.clone());
        self.dirty |= fired;
        fired
    }

    fn remove(&mut self, obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        self.list.remove(&obj.uid()).is_some()
    }

    fn change(&mut self, obj: &Obj, _reports: &[ChangeReport], _cx: &ApplyContext<'_>) -> bool {
        // the sort key may have moved
        let fired = self.list.replace(obj.clone());
        self.dirty |= fired;
        fired
    }
}

impl Materialized for Sorted {
    type Store = ListContainer;

    fn container(&self) -> &ListContainer {
        &self.list
    }

    fn prepare(&mut self) {
        if self.dirty {
            let compare = self.compare.clone();
            self.list.sort_by(|a, b| compare(a, b));
            self.dirty = false;
        }
    }
}
