//! Sessions: a client's handle to the blackboard
//!
//! A session owns its views, an inbox ring filled by the coordinator,
//! and an outbox built by the current transaction. Transactions follow
//! one protocol:
//!
//! ```text
//! open ──▶ admission ──▶ bind thread ──▶ drain inbox into views
//!   │
//!   ├─ publish_* / subscribe / unsubscribe   (outbox, views)
//!   │
//! close ──▶ stamp outbox ──▶ reset views ──▶ unbind ──▶ coordinator
//!                                                      (distribute, release)
//! ```
//!
//! Opens are reentrant on the owning thread; only the outermost open and
//! close do any work.

mod publish;
mod ring;

pub use publish::PublishCounters;

pub(crate) use publish::Publisher;
pub(crate) use ring::DeltaRing;

use blackboard_types::ChangeReport;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

use crate::coordinator::CoordinatorInner;
use crate::delta::{DeltaEnvelope, EnvelopeStamp};
use crate::error::{BlackboardError, Result, UsageError};
use crate::object::Obj;
use crate::persistence::SessionState;
use crate::predicate::{Predicate, SharedPredicate};
use crate::transaction::{self, Transaction};
use crate::types::{SessionId, ViewId};
use crate::view::{
    CollectionView, IncrementalView, QueryKind, Subscription, View, ViewKind, ViewState,
};

#[derive(Debug, Default)]
struct Slot {
    owner: Option<ThreadId>,
    depth: usize,
}

struct TxState {
    views: Vec<Arc<dyn View>>,
    outbox: DeltaEnvelope,
    transaction: Option<Arc<Transaction>>,
    counters: PublishCounters,
    new_subscriptions: bool,
    collections_changed: bool,
    opened_at: Option<DateTime<Utc>>,
}

pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) name: String,
    coordinator: Weak<CoordinatorInner>,
    slot: Mutex<Slot>,
    slot_cv: Condvar,
    pub(crate) ring: Mutex<DeltaRing>,
    state: Mutex<TxState>,
    ready_to_persist: AtomicBool,
    timestamped: bool,
    diagnostics: bool,
}

impl SessionShared {
    pub(crate) fn new(
        name: String,
        coordinator: Weak<CoordinatorInner>,
        timestamped: bool,
        diagnostics: bool,
    ) -> Self {
        Self {
            id: SessionId::new(),
            name,
            coordinator,
            slot: Mutex::new(Slot::default()),
            slot_cv: Condvar::new(),
            ring: Mutex::new(DeltaRing::default()),
            state: Mutex::new(TxState {
                views: Vec::new(),
                outbox: DeltaEnvelope::new(),
                transaction: None,
                counters: PublishCounters::default(),
                new_subscriptions: false,
                collections_changed: false,
                opened_at: None,
            }),
            ready_to_persist: AtomicBool::new(true),
            timestamped,
            diagnostics,
        }
    }

    /// Saved inbox state for a snapshot, if this session allows it
    pub(crate) fn persist_state(&self) -> Option<SessionState> {
        if !self.ready_to_persist.load(Ordering::SeqCst) {
            return None;
        }
        let (pending, in_flight) = self.ring.lock().persistable();
        Some(SessionState {
            session: self.name.clone(),
            pending,
            in_flight,
        })
    }
}

/// A client's handle to the blackboard
///
/// Dropping the session unregisters it and abandons any open
/// transaction without publishing its outbox.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn coordinator(&self) -> Result<Arc<CoordinatorInner>> {
        self.shared
            .coordinator
            .upgrade()
            .ok_or(BlackboardError::CoordinatorGone)
    }

    /// Open a transaction, blocking while a snapshot is pending
    pub fn open(&self) -> Result<()> {
        let me = thread::current().id();
        {
            let mut slot = self.shared.slot.lock();
            if slot.owner == Some(me) {
                slot.depth += 1;
                warn!(session = %self.shared.name, depth = slot.depth, "nested transaction open");
                return Ok(());
            }
            while slot.owner.is_some() {
                self.shared.slot_cv.wait(&mut slot);
            }
            slot.owner = Some(me);
            slot.depth = 1;
        }
        match self.begin(true) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Open a transaction if that can be done without blocking
    pub fn try_open(&self) -> Result<bool> {
        let me = thread::current().id();
        {
            let mut slot = self.shared.slot.lock();
            if slot.owner == Some(me) {
                slot.depth += 1;
                warn!(session = %self.shared.name, depth = slot.depth, "nested transaction open");
                return Ok(true);
            }
            if slot.owner.is_some() {
                return Ok(false);
            }
            slot.owner = Some(me);
            slot.depth = 1;
        }
        match self.begin(false) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.release_slot();
                Ok(false)
            }
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Open a transaction that closes when the returned guard drops
    pub fn transaction(&self) -> Result<TransactionScope<'_>> {
        self.open()?;
        Ok(TransactionScope {
            session: self,
            reset: true,
            closed: false,
        })
    }

    fn begin(&self, block: bool) -> Result<bool> {
        let coordinator = self.coordinator()?;
        // before admission, which a pending snapshot would hold on our own transaction
        if let Some(bound) = transaction::current() {
            return Err(UsageError::ThreadAlreadyBound {
                bound: bound.session_name().to_string(),
            }
            .into());
        }
        if block {
            coordinator.admit();
        } else if !coordinator.try_admit() {
            return Ok(false);
        }

        let tx = Arc::new(Transaction::new(self.shared.id, self.shared.name.clone()));
        if let Err(err) = transaction::open(tx.clone()) {
            coordinator.withdraw();
            return Err(err.into());
        }

        let envelopes = self.shared.ring.lock().begin();
        let views = {
            let mut state = self.shared.state.lock();
            state.transaction = Some(tx);
            state.opened_at = Some(Utc::now());
            state.views.clone()
        };

        let mut changed = false;
        for envelope in &envelopes {
            for view in &views {
                if view.receive(envelope) && view.wakes_owner() {
                    changed = true;
                }
            }
        }
        self.shared.state.lock().collections_changed = changed;
        debug!(
            session = %self.shared.name,
            envelopes = envelopes.len(),
            changed,
            "transaction opened"
        );
        Ok(true)
    }

    /// Close the transaction and reset every view's change tracking
    pub fn close_transaction(&self) -> Result<()> {
        self.close_transaction_with(true)
    }

    /// Close the transaction; `reset_changes = false` keeps added,
    /// removed and changed sets into the next transaction
    pub fn close_transaction_with(&self, reset_changes: bool) -> Result<()> {
        let me = thread::current().id();
        {
            let mut slot = self.shared.slot.lock();
            match slot.owner {
                None => return Err(self.usage(UsageError::NotOpen {
                    session: self.shared.name.clone(),
                })),
                Some(owner) if owner != me => {
                    return Err(self.usage(UsageError::NotOwner {
                        session: self.shared.name.clone(),
                    }))
                }
                Some(_) if slot.depth > 1 => {
                    slot.depth -= 1;
                    return Ok(());
                }
                Some(_) => {}
            }
        }
        let result = self.finish(reset_changes);
        self.release_slot();
        result
    }

    fn finish(&self, reset_changes: bool) -> Result<()> {
        let (envelope, views, tx) = {
            let mut state = self.shared.state.lock();
            let mut outbox = mem::take(&mut state.outbox);
            outbox.set_source(self.shared.name.clone());
            if self.shared.timestamped {
                let closed_at = Utc::now();
                outbox.set_stamp(EnvelopeStamp {
                    session: self.shared.name.clone(),
                    opened_at: state.opened_at.unwrap_or(closed_at),
                    closed_at,
                });
            }
            state.new_subscriptions = false;
            state.collections_changed = false;
            state.opened_at = None;
            (outbox, state.views.clone(), state.transaction.take())
        };

        if reset_changes {
            for view in &views {
                view.reset_changes();
            }
        }
        if let Some(tx) = &tx {
            if let Err(err) = transaction::close(tx) {
                warn!(session = %self.shared.name, ?err, "transaction binding already gone");
            }
        }
        debug!(session = %self.shared.name, records = envelope.len(), "transaction closing");
        self.coordinator()?.finish_transaction(&self.shared.name, envelope)
    }

    fn release_slot(&self) {
        let mut slot = self.shared.slot.lock();
        slot.owner = None;
        slot.depth = 0;
        self.shared.slot_cv.notify_one();
    }

    fn usage(&self, err: UsageError) -> BlackboardError {
        warn!(session = %self.shared.name, %err, "usage error");
        err.into()
    }

    fn require_transaction(&self, operation: &'static str) -> Result<()> {
        if self.shared.slot.lock().owner == Some(thread::current().id()) {
            Ok(())
        } else {
            Err(self.usage(UsageError::NotInTransaction {
                operation,
                session: self.shared.name.clone(),
            }))
        }
    }

    pub fn is_in_transaction(&self) -> bool {
        self.shared.slot.lock().owner == Some(thread::current().id())
    }

    /// Register a view of `kind` filtered by `predicate`
    ///
    /// The view fills on this session's next open, from the store or from
    /// saved state when the session is resuming after a restart.
    pub fn subscribe<K, P>(&self, predicate: P, kind: K) -> Result<Subscription<K>>
    where
        K: ViewKind,
        P: Predicate + 'static,
    {
        self.subscribe_shared(Arc::new(predicate), kind)
    }

    pub fn subscribe_shared<K: ViewKind>(
        &self,
        predicate: SharedPredicate,
        kind: K,
    ) -> Result<Subscription<K>> {
        self.require_transaction("subscribe")?;
        let coordinator = self.coordinator()?;
        let subscription = Subscription::new(predicate, kind);
        {
            let mut state = self.shared.state.lock();
            state.views.push(Arc::new(subscription.clone()));
            state.new_subscriptions = true;
        }
        coordinator.fill_subscription(&self.shared, subscription.id(), &subscription.predicate());
        debug!(session = %self.shared.name, view = %subscription.id(), "subscribed");
        Ok(subscription)
    }

    pub fn subscribe_collection<P: Predicate + 'static>(
        &self,
        predicate: P,
    ) -> Result<Subscription<CollectionView>> {
        self.subscribe(predicate, CollectionView::new())
    }

    pub fn subscribe_incremental<P: Predicate + 'static>(
        &self,
        predicate: P,
    ) -> Result<Subscription<IncrementalView>> {
        self.subscribe(predicate, IncrementalView::new())
    }

    pub fn unsubscribe(&self, view: ViewId) -> Result<()> {
        self.require_transaction("unsubscribe")?;
        let mut state = self.shared.state.lock();
        let before = state.views.len();
        state.views.retain(|v| v.id() != view);
        if state.views.len() == before {
            return Err(UsageError::UnknownView.into());
        }
        Ok(())
    }

    /// One-shot query against the store, outside any transaction state
    pub fn query<P: Predicate + 'static>(&self, predicate: P) -> Result<Vec<Obj>> {
        let coordinator = self.coordinator()?;
        let predicate: SharedPredicate = Arc::new(predicate);
        let objects = coordinator.query(&*predicate);
        let mut state = ViewState::new(predicate, QueryKind::new());
        state.fill(&DeltaEnvelope::initialize(ViewId::new(), objects));
        Ok(state.into_kind().into_objects())
    }

    pub fn publish_add(&self, obj: Obj) -> Result<bool> {
        self.require_transaction("publish_add")?;
        self.with_publisher(|publisher| publisher.add(obj))
    }

    pub fn publish_remove(&self, obj: Obj) -> Result<bool> {
        self.require_transaction("publish_remove")?;
        self.with_publisher(|publisher| publisher.remove(obj))
    }

    /// Publish a change, merging reports collected on this transaction
    /// with `changes`
    pub fn publish_change(&self, obj: Obj, changes: Option<Vec<ChangeReport>>) -> Result<bool> {
        self.require_transaction("publish_change")?;
        let collected = {
            let state = self.shared.state.lock();
            state
                .transaction
                .as_ref()
                .map(|tx| tx.take_change_reports(&obj.uid()))
                .unwrap_or_default()
        };
        let reports = transaction::merge_change_reports(collected, changes);
        self.with_publisher(|publisher| publisher.change(obj, reports))
    }

    pub fn publish_event(&self, obj: Obj) -> Result<bool> {
        self.require_transaction("publish_event")?;
        self.with_publisher(|publisher| publisher.event(obj))
    }

    fn with_publisher<R>(&self, f: impl FnOnce(&mut Publisher<'_>) -> Result<R>) -> Result<R> {
        let mut state = self.shared.state.lock();
        let TxState {
            outbox, counters, ..
        } = &mut *state;
        let mut publisher = Publisher {
            name: &self.shared.name,
            outbox,
            counters,
            diagnostics: self.shared.diagnostics,
        };
        f(&mut publisher)
    }

    /// Whether any view changed since the previous open
    pub fn have_collections_changed(&self) -> Result<bool> {
        self.require_transaction("have_collections_changed")?;
        let state = self.shared.state.lock();
        Ok(state.collections_changed
            || state.new_subscriptions
            || state
                .views
                .iter()
                .any(|view| view.wakes_owner() && view.has_changed()))
    }

    /// Allow or refuse inclusion of this session's inbox in snapshots
    pub fn set_ready_to_persist(&self, ready: bool) {
        self.shared.ready_to_persist.store(ready, Ordering::SeqCst);
    }

    pub fn counters(&self) -> PublishCounters {
        self.shared.state.lock().counters
    }

    /// Envelopes waiting for this session's next open
    pub fn pending_envelopes(&self) -> usize {
        self.shared.ring.lock().pending_len()
    }

    pub fn view_count(&self) -> usize {
        self.shared.state.lock().views.len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let abandoned = {
            let mut slot = self.shared.slot.lock();
            let open = slot.owner.take().is_some();
            slot.depth = 0;
            open
        };
        let coordinator = self.shared.coordinator.upgrade();
        if abandoned {
            warn!(session = %self.shared.name, "session dropped with an open transaction");
            if let Some(tx) = self.shared.state.lock().transaction.take() {
                transaction::forget(&tx);
            }
            if let Some(coordinator) = &coordinator {
                coordinator.withdraw();
            }
        }
        if let Some(coordinator) = coordinator {
            coordinator.unregister(self.shared.id);
        }
    }
}

/// Guard returned by [`Session::transaction`]
///
/// Closes the transaction when dropped. Use [`commit`](Self::commit) to
/// observe the close result.
pub struct TransactionScope<'a> {
    session: &'a Session,
    reset: bool,
    closed: bool,
}

impl TransactionScope<'_> {
    /// Keep view change tracking past this transaction's close
    pub fn keep_changes(&mut self) {
        self.reset = false;
    }

    pub fn commit(mut self) -> Result<()> {
        self.closed = true;
        self.session.close_transaction_with(self.reset)
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.session.close_transaction_with(self.reset) {
                warn!(session = self.session.name(), %err, "close on scope exit failed");
            }
        }
    }
}
