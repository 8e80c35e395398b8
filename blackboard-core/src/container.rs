//! Backing containers for materialized views

use blackboard_types::Uid;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::object::Obj;

/// Storage behind a materialized view
///
/// Implementations decide ordering and lookup cost. `HashContainer` is
/// the default; `ListContainer` keeps insertion order and can be sorted.
pub trait Container: Send + 'static {
    /// Insert an object, returns false if it was already present
    fn insert(&mut self, obj: Obj) -> bool;

    /// Swap in a new handle for a member, returns false if absent
    fn replace(&mut self, obj: Obj) -> bool;

    fn remove(&mut self, uid: &Uid) -> Option<Obj>;

    fn contains(&self, uid: &Uid) -> bool;

    fn get(&self, uid: &Uid) -> Option<&Obj>;

    fn iter(&self) -> Box<dyn Iterator<Item = &Obj> + '_>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

#[derive(Debug, Default)]
pub struct HashContainer {
    objects: HashMap<Uid, Obj>,
}

impl HashContainer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Container for HashContainer {
    fn insert(&mut self, obj: Obj) -> bool {
        self.objects.insert(obj.uid(), obj).is_none()
    }

    fn replace(&mut self, obj: Obj) -> bool {
        match self.objects.get_mut(&obj.uid()) {
            Some(slot) => {
                *slot = obj;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, uid: &Uid) -> Option<Obj> {
        self.objects.remove(uid)
    }

    fn contains(&self, uid: &Uid) -> bool {
        self.objects.contains_key(uid)
    }

    fn get(&self, uid: &Uid) -> Option<&Obj> {
        self.objects.get(uid)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Obj> + '_> {
        Box::new(self.objects.values())
    }

    fn len(&self) -> usize {
        self.objects.len()
    }

    fn clear(&mut self) {
        self.objects.clear();
    }
}

/// Ordered container; lookups are linear
#[derive(Debug, Default)]
pub struct ListContainer {
    objects: Vec<Obj>,
}

impl ListContainer {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, uid: &Uid) -> Option<usize> {
        self.objects.iter().position(|obj| obj.uid() == *uid)
    }

    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&Obj, &Obj) -> Ordering,
    {
        self.objects.sort_by(compare);
    }

    pub fn as_slice(&self) -> &[Obj] {
        &self.objects
    }
}

impl Container for ListContainer {
    fn insert(&mut self, obj: Obj) -> bool {
        match self.position(&obj.uid()) {
            Some(index) => {
                self.objects[index] = obj;
                false
            }
            None => {
                self.objects.push(obj);
                true
            }
        }
    }

    fn replace(&mut self, obj: Obj) -> bool {
        match self.position(&obj.uid()) {
            Some(index) => {
                self.objects[index] = obj;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, uid: &Uid) -> Option<Obj> {
        self.position(uid).map(|index| self.objects.remove(index))
    }

    fn contains(&self, uid: &Uid) -> bool {
        self.position(uid).is_some()
    }

    fn get(&self, uid: &Uid) -> Option<&Obj> {
        self.objects.iter().find(|obj| obj.uid() == *uid)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Obj> + '_> {
        Box::new(self.objects.iter())
    }

    fn len(&self) -> usize {
        self.objects.len()
    }

    fn clear(&mut self) {
        self.objects.clear();
    }
}
