//! Coordinator for a blackboard
//!
//! The coordinator owns the store and manages:
//! - Sessions (registration, fan-out of committed envelopes)
//! - Rule re-entry until the store stops producing output
//! - Snapshots (admission barrier, eager and lazy scheduling)
//! - Rehydration of a restarted store and its resuming sessions
//! - Message and address plumbing for domain rules

mod admission;
mod rehydration;
mod scheduler;

use blackboard_types::{GroupAddress, MessageAddress};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::config::BlackboardConfig;
use crate::delta::DeltaEnvelope;
use crate::error::{BlackboardError, PersistenceError, PublishConflict, Result, UsageError};
use crate::messaging::{AckMessage, DirectiveMessage, MessageTransport, NullTransport};
use crate::object::Obj;
use crate::persistence::{Persistence, PersistenceReport, Snapshot};
use crate::predicate::{Predicate, SharedPredicate};
use crate::rules::DomainRule;
use crate::session::{PublishCounters, Session, SessionShared};
use crate::store::{AddressResolver, StaticResolver, Store};
use crate::transaction;
use crate::types::{SessionId, ViewId};
use crate::worker::{Debouncer, Worker};
use admission::{Admission, LazyRequest};
use rehydration::RehydrationInfo;

/// Everything guarded by the distribution lock
struct Distribution {
    store: Store,
    sessions: BTreeMap<SessionId, Weak<SessionShared>>,
    /// Envelopes distributed since the last successful snapshot
    epoch: Vec<Arc<DeltaEnvelope>>,
    rehydration: Option<RehydrationInfo>,
    distributed: u64,
}

pub(crate) struct CoordinatorInner {
    name: String,
    config: BlackboardConfig,
    admission: Admission,
    distribution: Mutex<Distribution>,
    persistence: Option<Arc<dyn Persistence>>,
    transport: Arc<dyn MessageTransport>,
    workers: Mutex<Vec<Worker>>,
    debouncer: Mutex<Option<Debouncer<GroupAddress>>>,
}

/// Builder for a [`Coordinator`]
pub struct CoordinatorBuilder {
    name: String,
    config: BlackboardConfig,
    persistence: Option<Arc<dyn Persistence>>,
    transport: Arc<dyn MessageTransport>,
    resolver: Arc<dyn AddressResolver>,
    rules: Vec<Arc<dyn DomainRule>>,
    workers: bool,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: BlackboardConfig) -> Self {
        self.config = config;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn rule(mut self, rule: impl DomainRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn rule_shared(mut self, rule: Arc<dyn DomainRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Skip the snapshot scheduler, sweeper and address debouncer
    ///
    /// Snapshots then only happen on explicit request, and group changes
    /// invalidate the address cache immediately.
    pub fn without_workers(mut self) -> Self {
        self.workers = false;
        self
    }

    /// Validate the configuration, rehydrate and start the workers
    pub fn start(self) -> Result<Coordinator> {
        self.config.validate()?;

        let incarnation = Utc::now().timestamp_millis().max(0) as u64;
        let mut store = Store::new(
            self.name.clone(),
            self.resolver,
            self.config.addresses.cache_capacity,
            self.config.publish_diagnostics,
            self.config.timestamp_envelopes,
            incarnation,
        );
        for rule in self.rules {
            store.add_rule(rule);
        }

        let coordinator = Coordinator {
            inner: Arc::new(CoordinatorInner {
                name: self.name,
                config: self.config,
                admission: Admission::default(),
                distribution: Mutex::new(Distribution {
                    store,
                    sessions: BTreeMap::new(),
                    epoch: Vec::new(),
                    rehydration: None,
                    distributed: 0,
                }),
                persistence: self.persistence,
                transport: self.transport,
                workers: Mutex::new(Vec::new()),
                debouncer: Mutex::new(None),
            }),
        };

        coordinator.inner.rehydrate()?;
        if self.workers {
            coordinator.spawn_workers()?;
        }
        info!(
            name = %coordinator.inner.name,
            incarnation,
            persistence = coordinator.inner.persistence.is_some(),
            "blackboard started"
        );
        Ok(coordinator)
    }
}

/// Single point of distribution for one blackboard
///
/// Sessions commit envelopes through the coordinator; it applies each one
/// to the store, runs domain rules until they stop publishing, and fans
/// every resulting envelope out to all registered sessions in one global
/// order. Handles are cheap to clone.
///
/// # Example
///
/// ```rust,ignore
/// use blackboard_core::{Coordinator, Pattern, Record};
///
/// let coordinator = Coordinator::builder("tasks").without_workers().start()?;
///
/// let writer = coordinator.session("writer");
/// let reader = coordinator.session("reader");
///
/// reader.open()?;
/// let tasks = reader.subscribe_collection(Pattern::kind("task"))?;
/// reader.close_transaction()?;
///
/// writer.open()?;
/// writer.publish_add(Record::new("task").with_field("title", "write docs").into_obj())?;
/// writer.close_transaction()?;
///
/// reader.open()?;
/// assert_eq!(tasks.len(), 1);
/// reader.close_transaction()?;
/// ```
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    pub fn builder(name: impl Into<String>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            name: name.into(),
            config: BlackboardConfig::default(),
            persistence: None,
            transport: Arc::new(NullTransport),
            resolver: Arc::new(StaticResolver::new()),
            rules: Vec::new(),
            workers: true,
        }
    }

    /// Start with defaults, no persistence and no workers
    pub fn in_memory(name: impl Into<String>) -> Result<Self> {
        Self::builder(name).without_workers().start()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &BlackboardConfig {
        &self.inner.config
    }

    /// Register a new session
    ///
    /// The session starts with an empty inbox; views it subscribes are
    /// filled from the store (or from its saved state while rehydrating).
    pub fn session(&self, name: impl Into<String>) -> Session {
        let shared = Arc::new(SessionShared::new(
            name.into(),
            Arc::downgrade(&self.inner),
            self.inner.config.timestamp_envelopes,
            self.inner.config.publish_diagnostics,
        ));
        let mut dist = self.inner.distribution.lock();
        dist.sessions.insert(shared.id, Arc::downgrade(&shared));
        debug!(session = %shared.name, id = %shared.id, "session registered");
        drop(dist);
        Session::new(shared)
    }

    pub fn session_count(&self) -> usize {
        let dist = self.inner.distribution.lock();
        dist.sessions.values().filter(|s| s.strong_count() > 0).count()
    }

    /// Take a snapshot now, waiting for open transactions to drain
    ///
    /// Must not be called from a thread with an open transaction.
    pub fn snapshot(&self, want_result: bool, full: bool) -> Result<Option<PersistenceReport>> {
        if self.inner.persistence.is_none() {
            return Err(PersistenceError::NotEnabled.into());
        }
        if transaction::current().is_some() {
            warn!("snapshot requested from inside a transaction");
            return Err(UsageError::SnapshotInsideTransaction.into());
        }
        let full = self.inner.admission.begin_snapshot(full);
        let outcome = self.inner.perform_snapshot(full, want_result);
        self.inner.admission.end_snapshot(outcome.is_ok());
        outcome
    }

    /// Ask for a snapshot if one is due, without waiting for a drain
    ///
    /// Returns whether a snapshot was taken or scheduled for the next
    /// moment no transaction is open.
    pub fn request_lazy_snapshot(&self) -> Result<bool> {
        let persistence = self
            .inner
            .persistence
            .as_ref()
            .ok_or(PersistenceError::NotEnabled)?;
        let due = persistence.snapshot_due(self.inner.admission.last_snapshot());
        if due > Utc::now() {
            return Ok(false);
        }
        match self.inner.admission.request_lazy(false) {
            LazyRequest::RunNow => {
                let outcome = self.inner.perform_snapshot(false, false);
                self.inner.admission.end_snapshot(outcome.is_ok());
                outcome.map(|_| true)
            }
            LazyRequest::Deferred => {
                debug!("lazy snapshot deferred to the last close");
                Ok(true)
            }
            LazyRequest::AlreadyPending => Ok(false),
        }
    }

    pub fn last_snapshot(&self) -> Option<DateTime<Utc>> {
        self.inner.admission.last_snapshot()
    }

    /// Hand inbound directive messages to the store's rules
    ///
    /// Restarted peers are reported to the rules first; messages the
    /// transport judges stale are dropped. Returns how many were handled.
    pub fn receive_messages(&self, messages: &[DirectiveMessage]) -> Result<usize> {
        let transport = self.inner.transport.clone();
        self.inner.with_store_admitted(|store| {
            let mut handled = 0;
            for message in messages {
                let flags = transport.receive_message(message);
                if flags.is_restart() {
                    store.restart(&message.source);
                }
                if flags.should_ignore() {
                    debug!(source = %message.source, %flags, "ignoring message");
                    continue;
                }
                store.receive_message(message);
                handled += 1;
            }
            handled
        })
    }

    /// Process acknowledgements; returns how many revealed a peer restart
    pub fn receive_acks(&self, acks: &[AckMessage]) -> Result<usize> {
        let transport = self.inner.transport.clone();
        self.inner.with_store_admitted(|store| {
            let mut restarts = 0;
            for ack in acks {
                if transport.receive_ack(ack).is_restart() {
                    store.restart(&ack.source);
                    restarts += 1;
                }
            }
            restarts
        })
    }

    /// Note that a group's membership may have changed
    ///
    /// With workers running the refresh is debounced; otherwise the cached
    /// translation is dropped and re-resolved on next use.
    pub fn notify_group_changed(&self, group: GroupAddress) {
        if let Some(debouncer) = self.inner.debouncer.lock().as_ref() {
            debouncer.notify(group);
            return;
        }
        self.inner.distribution.lock().store.addresses().invalidate(&group);
    }

    /// Re-resolve `groups` now and tell the rules about any that changed
    pub fn refresh_addresses(&self, groups: &[GroupAddress]) -> Result<usize> {
        self.inner.refresh_addresses(groups)
    }

    pub fn resolve(&self, group: &GroupAddress) -> Vec<MessageAddress> {
        self.inner.distribution.lock().store.addresses().resolve(group)
    }

    /// Stop filling new views from saved session state
    pub fn finish_rehydration(&self) {
        let mut dist = self.inner.distribution.lock();
        if dist.rehydration.take().is_some() {
            info!(name = %self.inner.name, "rehydration finished");
        }
    }

    pub fn is_rehydrating(&self) -> bool {
        self.inner.distribution.lock().rehydration.is_some()
    }

    pub fn add_rule(&self, rule: Arc<dyn DomainRule>) {
        self.inner.distribution.lock().store.add_rule(rule);
    }

    /// Read the store under the distribution lock
    pub fn with_store<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&self.inner.distribution.lock().store)
    }

    pub fn query<P: Predicate>(&self, predicate: &P) -> Vec<Obj> {
        self.inner.query(predicate)
    }

    pub fn stats(&self) -> CoordinatorStats {
        let snapshots = self.inner.admission.snapshots();
        let last_snapshot = self.inner.admission.last_snapshot();
        let open_transactions = self.inner.admission.open_count();

        let dist = self.inner.distribution.lock();
        CoordinatorStats {
            name: self.inner.name.clone(),
            sessions: dist.sessions.values().filter(|s| s.strong_count() > 0).count(),
            objects: dist.store.len(),
            distributed: dist.distributed,
            epoch: dist.epoch.len(),
            snapshots,
            last_snapshot,
            open_transactions,
            rehydrating: dist.rehydration.is_some(),
            store: dist.store.counters(),
        }
    }

    /// Stop the background workers
    ///
    /// Must not be called from a thread with an open transaction, since a
    /// running snapshot tick may be waiting for it.
    pub fn shutdown(&self) {
        let workers = mem::take(&mut *self.inner.workers.lock());
        let count = workers.len();
        drop(workers);
        let debouncer = self.inner.debouncer.lock().take();
        drop(debouncer);
        info!(name = %self.inner.name, workers = count, "blackboard shut down");
    }

    fn spawn_workers(&self) -> Result<()> {
        let config = &self.inner.config;
        let mut workers = Vec::new();

        if let (Some(interval), Some(_)) = (config.snapshot_interval(), &self.inner.persistence) {
            let weak = Arc::downgrade(&self.inner);
            workers.push(Worker::periodic("blackboard-snapshot", interval, move || {
                if let Some(inner) = weak.upgrade() {
                    scheduler::tick(&Coordinator { inner });
                }
            })?);
        }

        workers.push(Worker::periodic(
            "blackboard-sweeper",
            config.sweep_interval(),
            || {
                let removed = transaction::sweep();
                if removed > 0 {
                    debug!(removed, "swept transaction bindings of dead threads");
                }
            },
        )?);

        let weak = Arc::downgrade(&self.inner);
        let debouncer = Debouncer::new(
            "blackboard-addresses",
            config.debounce(),
            move |groups: Vec<GroupAddress>| {
                if let Some(inner) = weak.upgrade() {
                    if let Err(err) = inner.refresh_addresses(&groups) {
                        warn!(%err, "address refresh failed");
                    }
                }
            },
        )?;

        debug!(workers = workers.len(), "workers started");
        *self.inner.workers.lock() = workers;
        *self.inner.debouncer.lock() = Some(debouncer);
        Ok(())
    }
}

impl CoordinatorInner {
    pub(crate) fn admit(&self) {
        self.admission.admit();
    }

    pub(crate) fn try_admit(&self) -> bool {
        self.admission.try_admit()
    }

    /// Give back an admission without publishing anything
    pub(crate) fn withdraw(&self) {
        self.release();
    }

    /// Distribute a closing session's outbox, then release its admission
    ///
    /// The envelope is delivered even when some of its records conflict;
    /// the first conflict is reported to the closing session.
    pub(crate) fn finish_transaction(&self, session: &str, envelope: DeltaEnvelope) -> Result<()> {
        let outcome = if envelope.is_empty() {
            Ok(Vec::new())
        } else {
            self.distribute_and_send(envelope)
        };
        self.release();

        let conflicts = outcome?;
        if !conflicts.is_empty() {
            warn!(session, conflicts = conflicts.len(), "transaction committed with conflicts");
        }
        match conflicts.into_iter().next() {
            Some(conflict) => Err(conflict.into()),
            None => Ok(()),
        }
    }

    /// Queue the initial fill of a newly subscribed view
    ///
    /// The fill travels through the session's inbox so envelopes already
    /// queued ahead of it are not applied twice.
    pub(crate) fn fill_subscription(
        &self,
        session: &SessionShared,
        view: ViewId,
        predicate: &SharedPredicate,
    ) {
        let saved = self
            .persistence
            .as_ref()
            .and_then(|p| p.subscriber_state(&session.name));

        let dist = self.distribution.lock();
        let envelopes = match (dist.rehydration.as_ref(), saved) {
            (Some(info), Some(state)) => {
                debug!(session = %session.name, %view, "filling view from saved state");
                info.fill_envelopes(view, &state)
            }
            _ => vec![DeltaEnvelope::initialize(view, dist.store.query(&**predicate))],
        };
        let mut ring = session.ring.lock();
        for envelope in envelopes {
            ring.receive(Arc::new(envelope));
        }
    }

    pub(crate) fn unregister(&self, id: SessionId) {
        if self.distribution.lock().sessions.remove(&id).is_some() {
            debug!(%id, "session unregistered");
        }
    }

    pub(crate) fn query(&self, predicate: &dyn Predicate) -> Vec<Obj> {
        self.distribution.lock().store.query(predicate)
    }

    fn release(&self) {
        if let Some(pending) = self.admission.release() {
            let outcome = self.perform_snapshot(pending.full, false);
            self.admission.end_snapshot(outcome.is_ok());
            if let Err(err) = outcome {
                error!(%err, "lazy snapshot failed, retrying next tick");
            }
        }
    }

    fn refresh_addresses(&self, groups: &[GroupAddress]) -> Result<usize> {
        self.with_store_admitted(|store| store.refresh_addresses(groups))
    }

    /// Run `f` against the store as if inside a transaction
    ///
    /// Whatever the rules publish or send in response is distributed
    /// before the admission is released.
    fn with_store_admitted<R>(&self, f: impl FnOnce(&mut Store) -> R) -> Result<R> {
        // A thread inside a transaction already holds an admission.
        let admitted = transaction::current().is_none();
        if admitted {
            self.admission.admit();
        }
        let (result, outcome, messages) = {
            let mut dist = self.distribution.lock();
            let result = f(&mut dist.store);
            let outcome = match dist.store.take_output() {
                Some(output) => self.distribute(&mut dist, output),
                None => Ok(Vec::new()),
            };
            let messages = dist.store.take_messages();
            (result, outcome, messages)
        };
        self.send(messages);
        if admitted {
            self.release();
        }
        outcome.map(|_| result)
    }

    fn distribute_and_send(&self, envelope: DeltaEnvelope) -> Result<Vec<PublishConflict>> {
        let (outcome, messages) = {
            let mut dist = self.distribution.lock();
            let outcome = self.distribute(&mut dist, envelope);
            (outcome, dist.store.take_messages())
        };
        self.send(messages);
        outcome
    }

    /// Apply an envelope and every rule reaction to the store, then fan
    /// them out in application order
    fn distribute(
        &self,
        dist: &mut Distribution,
        envelope: DeltaEnvelope,
    ) -> Result<Vec<PublishConflict>> {
        let mut work = VecDeque::from([envelope]);
        let mut delivered = Vec::new();
        let mut conflicts = Vec::new();
        let mut rounds = 0;
        let mut diverged = false;

        while let Some(envelope) = work.pop_front() {
            conflicts.extend(dist.store.apply_envelope(&envelope));
            delivered.push(Arc::new(envelope));
            if let Some(output) = dist.store.take_output() {
                rounds += 1;
                if self.config.max_rule_rounds.is_some_and(|max| rounds > max) {
                    error!(rounds, "rules did not settle, dropping their last output");
                    diverged = true;
                    break;
                }
                work.push_back(output);
            }
        }

        self.fan_out(dist, &delivered);
        if diverged {
            return Err(BlackboardError::RuleDivergence { rounds });
        }
        Ok(conflicts)
    }

    fn fan_out(&self, dist: &mut Distribution, delivered: &[Arc<DeltaEnvelope>]) {
        dist.sessions.retain(|_, session| session.strong_count() > 0);
        for session in dist.sessions.values().filter_map(Weak::upgrade) {
            let mut ring = session.ring.lock();
            for envelope in delivered {
                ring.receive(envelope.clone());
            }
        }

        dist.epoch.extend(delivered.iter().cloned());
        if let Some(info) = dist.rehydration.as_mut() {
            info.post.extend(delivered.iter().cloned());
        }
        dist.distributed += delivered.len() as u64;
        debug!(
            envelopes = delivered.len(),
            sessions = dist.sessions.len(),
            "distributed"
        );
    }

    fn send(&self, messages: Vec<DirectiveMessage>) {
        if messages.is_empty() {
            return;
        }
        debug!(count = messages.len(), "sending directive messages");
        self.transport.send_messages(&mut messages.into_iter());
    }

    /// Write the epoch and session inboxes to persistence
    ///
    /// Callers hold the snapshot flag, so no transaction is open. On
    /// failure the epoch is kept and the next snapshot retries it.
    fn perform_snapshot(&self, full: bool, want_result: bool) -> Result<Option<PersistenceReport>> {
        let persistence = self
            .persistence
            .as_ref()
            .ok_or(PersistenceError::NotEnabled)?;

        let mut dist = self.distribution.lock();
        let sessions = dist
            .sessions
            .values()
            .filter_map(Weak::upgrade)
            .filter_map(|session| session.persist_state())
            .collect::<Vec<_>>();
        let snapshot = Snapshot {
            epoch: dist.epoch.clone(),
            sessions,
            message_state: self.transport.state(),
            baseline: full.then(|| dist.store.objects()),
            full,
            taken_at: Utc::now(),
        };
        let envelopes = snapshot.epoch.len();
        let sessions = snapshot.sessions.len();

        match persistence.persist(snapshot, want_result) {
            Ok(report) => {
                dist.epoch.clear();
                dist.rehydration = None;
                info!(envelopes, sessions, full, "snapshot written");
                Ok(report)
            }
            Err(err) => {
                error!(%err, envelopes, "snapshot failed, keeping epoch for retry");
                Err(err.into())
            }
        }
    }

    /// Reload the saved baseline and redistribute undelivered envelopes
    fn rehydrate(&self) -> Result<()> {
        let Some(persistence) = self.persistence.clone() else {
            return Ok(());
        };
        let mut baseline = DeltaEnvelope::invisible();
        let Some(rehydration) = persistence.rehydrate(&mut baseline)? else {
            debug!(name = %self.name, "nothing to rehydrate");
            return Ok(());
        };
        baseline.set_source(self.name.clone());

        let objects: Vec<Obj> = baseline
            .records()
            .iter()
            .flat_map(|record| record.objects())
            .cloned()
            .collect();
        if let Some(state) = rehydration.message_state {
            self.transport.restore(state);
        }
        let undelivered = rehydration.undelivered.len();
        let resuming = persistence.has_subscriber_states();

        let messages = {
            let mut dist = self.distribution.lock();
            for conflict in dist.store.apply_envelope(&baseline) {
                warn!(%conflict, "conflict in saved baseline");
            }
            if resuming {
                dist.rehydration = Some(RehydrationInfo::new(objects.clone()));
            }
            if let Some(output) = dist.store.take_output() {
                self.distribute(&mut dist, output)?;
            }
            for envelope in rehydration.undelivered {
                self.distribute(&mut dist, envelope)?;
            }
            dist.store.take_messages()
        };
        self.send(messages);

        info!(
            name = %self.name,
            objects = objects.len(),
            undelivered,
            resuming,
            "rehydrated"
        );
        Ok(())
    }
}

/// Point-in-time counters for one coordinator
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub name: String,
    /// Live registered sessions
    pub sessions: usize,
    pub objects: usize,
    /// Envelopes fanned out since start
    pub distributed: u64,
    /// Envelopes waiting for the next snapshot
    pub epoch: usize,
    pub snapshots: u64,
    pub last_snapshot: Option<DateTime<Utc>>,
    pub open_transactions: usize,
    pub rehydrating: bool,
    /// What the store's own rules have published
    pub store: PublishCounters,
}
