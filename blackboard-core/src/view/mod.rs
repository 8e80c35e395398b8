//! Views: predicate-filtered projections of the blackboard
//!
//! Every view is a [`Subscription`] over some [`ViewKind`]. The shared
//! base ([`ViewState`]) evaluates the predicate, tracks the initialized
//! and changed flags, and handles dynamic-membership collections; the
//! kind decides what "add", "remove" and "change" mean for its storage.
//!
//! A view ignores ordinary fan-out until its one-time fill marker has
//! been delivered through its session's inbox. Anything committed before
//! the fill is already part of the fill, and anything after arrives
//! behind it, so each record reaches the view exactly once.

mod collection;
mod event;
mod incremental;
mod query;
mod sorted;
mod timestamp;

pub use collection::{Collection, CollectionView};
pub use event::{EventKind, Trigger};
pub use incremental::{Incremental, IncrementalView};
pub use query::QueryKind;
pub use sorted::{Comparator, Sorted};
pub use timestamp::{TimestampKind, Timestamps};

use blackboard_types::{ChangeReport, Uid};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::container::Container;
use crate::delta::{ApplyContext, DeltaEnvelope, EnvelopeTarget};
use crate::object::Obj;
use crate::predicate::SharedPredicate;
use crate::types::ViewId;

/// Receiver side of [`DeltaEnvelope::apply_to`]
///
/// Each call evaluates the view's predicate and returns whether the view
/// was altered.
pub trait Conditional {
    fn conditional_add(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool;

    fn conditional_remove(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool;

    fn conditional_change(
        &mut self,
        obj: &Obj,
        reports: &[ChangeReport],
        cx: &ApplyContext<'_>,
    ) -> bool;

    fn conditional_event(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool;
}

/// Kind-specific behavior of a view, called only for matching objects
pub trait ViewKind: Send + 'static {
    fn add(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool;

    fn remove(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool;

    fn change(&mut self, obj: &Obj, reports: &[ChangeReport], cx: &ApplyContext<'_>) -> bool;

    fn event(&mut self, _obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        false
    }

    /// Clear per-transaction tracking
    fn reset(&mut self) {}

    /// Whether changes to this view should count as waking its owner
    fn wakes_owner(&self) -> bool {
        true
    }

    /// For dynamic-predicate kinds, whether `uid` is currently a member
    ///
    /// `None` means membership is decided by the predicate alone.
    fn dynamic_membership(&self, _uid: &Uid) -> Option<bool> {
        None
    }

    /// Called once after the initial fill has been applied
    fn filled(&mut self) {}
}

/// View kinds backed by a container
pub trait Materialized {
    type Store: Container;

    fn container(&self) -> &Self::Store;

    /// Bring the container up to date before it is read
    fn prepare(&mut self) {}
}

/// Object-safe interface a session uses to drive its views
pub trait View: Send + Sync {
    fn id(&self) -> ViewId;

    fn predicate(&self) -> SharedPredicate;

    fn is_initialized(&self) -> bool;

    fn has_changed(&self) -> bool;

    fn wakes_owner(&self) -> bool;

    /// Apply one inbox envelope, returns whether the view changed
    fn receive(&self, envelope: &DeltaEnvelope) -> bool;

    fn reset_changes(&self);
}

struct ViewCore {
    predicate: SharedPredicate,
    initialized: bool,
    changed: bool,
}

/// Shared base of every view kind
pub struct ViewState<K> {
    core: ViewCore,
    kind: K,
}

impl<K: ViewKind> ViewState<K> {
    pub fn new(predicate: SharedPredicate, kind: K) -> Self {
        Self {
            core: ViewCore {
                predicate,
                initialized: false,
                changed: false,
            },
            kind,
        }
    }

    /// One-time initial load
    ///
    /// Flags the view as changed even though the fill itself is not
    /// tracked as visible adds.
    pub fn fill(&mut self, envelope: &DeltaEnvelope) {
        self.core.initialized = true;
        envelope.apply_to(self);
        self.kind.filled();
        self.core.changed = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.core.initialized
    }

    pub fn has_changed(&self) -> bool {
        self.core.changed
    }

    pub fn reset_changes(&mut self) {
        self.core.changed = false;
        self.kind.reset();
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut K {
        &mut self.kind
    }

    pub fn into_kind(self) -> K {
        self.kind
    }

    fn mark(&mut self, fired: bool, cx: &ApplyContext<'_>) -> bool {
        if fired && cx.visible {
            self.core.changed = true;
        }
        fired
    }
}

impl<K: ViewKind> Conditional for ViewState<K> {
    fn conditional_add(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool {
        if !self.core.predicate.matches(obj) {
            return false;
        }
        let fired = self.kind.add(obj, cx);
        self.mark(fired, cx)
    }

    fn conditional_remove(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool {
        // a member whose fields moved it out of the predicate must still leave
        let member = self.kind.dynamic_membership(&obj.uid()) == Some(true);
        if !member && !self.core.predicate.matches(obj) {
            return false;
        }
        let fired = self.kind.remove(obj, cx);
        self.mark(fired, cx)
    }

    fn conditional_change(
        &mut self,
        obj: &Obj,
        reports: &[ChangeReport],
        cx: &ApplyContext<'_>,
    ) -> bool {
        let is_in = self.core.predicate.matches(obj);
        let fired = match self.kind.dynamic_membership(&obj.uid()) {
            Some(was_in) => match (was_in, is_in) {
                (false, true) => self.kind.add(obj, cx),
                (true, false) => self.kind.remove(obj, cx),
                (true, true) => self.kind.change(obj, reports, cx),
                (false, false) => false,
            },
            None if is_in => self.kind.change(obj, reports, cx),
            None => false,
        };
        self.mark(fired, cx)
    }

    fn conditional_event(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool {
        if !self.core.predicate.matches(obj) {
            return false;
        }
        let fired = self.kind.event(obj, cx);
        self.mark(fired, cx)
    }
}

/// Handle to a view owned by a session
///
/// Cloning shares the same underlying view.
pub struct Subscription<K> {
    id: ViewId,
    predicate: SharedPredicate,
    inner: Arc<Mutex<ViewState<K>>>,
}

impl<K> Clone for Subscription<K> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            predicate: self.predicate.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<K: ViewKind> Subscription<K> {
    pub(crate) fn new(predicate: SharedPredicate, kind: K) -> Self {
        Self {
            id: ViewId::new(),
            predicate: predicate.clone(),
            inner: Arc::new(Mutex::new(ViewState::new(predicate, kind))),
        }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Run `f` with read access to the view's kind
    pub fn read<R>(&self, f: impl FnOnce(&K) -> R) -> R {
        f(self.inner.lock().kind())
    }
}

impl<K: ViewKind + Materialized> Subscription<K> {
    /// Current members, in container order
    pub fn snapshot(&self) -> Vec<Obj> {
        let mut state = self.inner.lock();
        state.kind_mut().prepare();
        state.kind().container().iter().cloned().collect()
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.inner.lock().kind().container().contains(uid)
    }

    pub fn get(&self, uid: &Uid) -> Option<Obj> {
        self.inner.lock().kind().container().get(uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().kind().container().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: ViewKind> View for Subscription<K> {
    fn id(&self) -> ViewId {
        self.id
    }

    fn predicate(&self) -> SharedPredicate {
        self.predicate.clone()
    }

    fn is_initialized(&self) -> bool {
        self.inner.lock().is_initialized()
    }

    fn has_changed(&self) -> bool {
        self.inner.lock().has_changed()
    }

    fn wakes_owner(&self) -> bool {
        self.inner.lock().kind().wakes_owner()
    }

    fn receive(&self, envelope: &DeltaEnvelope) -> bool {
        let mut state = self.inner.lock();
        match envelope.target() {
            EnvelopeTarget::Initialize(id) if id == self.id => {
                if state.is_initialized() {
                    warn!(view = %self.id, "duplicate fill marker ignored");
                    return false;
                }
                state.fill(envelope);
                true
            }
            EnvelopeTarget::Replay(id) if id == self.id && state.is_initialized() => {
                envelope.apply_to(&mut *state)
            }
            EnvelopeTarget::All if state.is_initialized() => envelope.apply_to(&mut *state),
            _ => false,
        }
    }

    fn reset_changes(&self) {
        self.inner.lock().reset_changes();
    }
}
