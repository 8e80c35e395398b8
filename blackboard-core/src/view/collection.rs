use blackboard_types::{ChangeReport, Uid};

use super::{Materialized, ViewKind};
use crate::container::{Container, HashContainer};
use crate::delta::ApplyContext;
use crate::object::Obj;

/// Materialized membership over a container
#[derive(Debug, Default)]
pub struct Collection<C> {
    container: C,
    dynamic: bool,
}

/// Collection view over the default hash container
pub type CollectionView = Collection<HashContainer>;

impl<C: Container + Default> Collection<C> {
    pub fn new() -> Self {
        Self::with_container(C::default())
    }

    /// Re-evaluate the predicate on every change
    pub fn dynamic() -> Self {
        Self {
            container: C::default(),
            dynamic: true,
        }
    }
}

impl<C: Container> Collection<C> {
    pub fn with_container(container: C) -> Self {
        Self {
            container,
            dynamic: false,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }
}

impl<C: Container> ViewKind for Collection<C> {
    fn add(&mut self, obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        self.container.insert(obj.clone())
    }

    fn remove(&mut self, obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        self.container.remove(&obj.uid()).is_some()
    }

    fn change(&mut self, obj: &Obj, _reports: &[ChangeReport], _cx: &ApplyContext<'_>) -> bool {
        self.container.replace(obj.clone())
    }

    fn dynamic_membership(&self, uid: &Uid) -> Option<bool> {
        self.dynamic.then(|| self.container.contains(uid))
    }
}

impl<C: Container> Materialized for Collection<C> {
    type Store = C;

    fn container(&self) -> &C {
        &self.container
    }
}
