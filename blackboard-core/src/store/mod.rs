//! The store: the distinguished session holding full membership
//!
//! The store applies every committed envelope to its membership, runs
//! domain rules over each accepted record, and buffers what the rules
//! publish and send until the coordinator collects it.

mod address;
mod membership;

pub use address::{AddressCache, AddressResolver, StaticResolver, Translation};

use blackboard_types::{ChangeReport, GroupAddress, MessageAddress, Uid};
use chrono::Utc;
use std::any::Any;
use std::collections::BTreeMap;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::delta::{DeltaEnvelope, DeltaRecord, EnvelopeStamp};
use crate::error::{PublishConflict, Result};
use crate::messaging::{Directive, DirectiveMessage};
use crate::object::Obj;
use crate::predicate::Predicate;
use crate::rules::{DomainRule, RuleError};
use crate::session::{PublishCounters, Publisher};
use crate::transaction;
use membership::Membership;

pub struct Store {
    name: String,
    membership: Membership,
    outbox: DeltaEnvelope,
    counters: PublishCounters,
    rules: Vec<Arc<dyn DomainRule>>,
    outgoing: BTreeMap<MessageAddress, Vec<Directive>>,
    addresses: AddressCache,
    diagnostics: bool,
    timestamped: bool,
    incarnation: u64,
}

impl Store {
    pub(crate) fn new(
        name: String,
        resolver: Arc<dyn AddressResolver>,
        cache_capacity: usize,
        diagnostics: bool,
        timestamped: bool,
        incarnation: u64,
    ) -> Self {
        Self {
            name,
            membership: Membership::new(diagnostics),
            outbox: DeltaEnvelope::new(),
            counters: PublishCounters::default(),
            rules: Vec::new(),
            outgoing: BTreeMap::new(),
            addresses: AddressCache::new(resolver, cache_capacity),
            diagnostics,
            timestamped,
            incarnation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.membership.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.membership.contains(uid)
    }

    pub fn get(&self, uid: &Uid) -> Option<Obj> {
        self.membership.get(uid).cloned()
    }

    pub fn query(&self, predicate: &dyn Predicate) -> Vec<Obj> {
        self.membership
            .iter()
            .filter(|obj| predicate.matches(obj))
            .cloned()
            .collect()
    }

    /// Every member, sorted by uid
    pub fn objects(&self) -> Vec<Obj> {
        let mut objects: Vec<Obj> = self.membership.iter().cloned().collect();
        objects.sort_by_key(|obj| obj.uid());
        objects
    }

    pub fn counters(&self) -> PublishCounters {
        self.counters
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name().to_string()).collect()
    }

    pub(crate) fn add_rule(&mut self, rule: Arc<dyn DomainRule>) {
        self.rules.push(rule);
    }

    pub(crate) fn addresses(&mut self) -> &mut AddressCache {
        &mut self.addresses
    }

    /// Apply one envelope and run rules over every accepted record
    ///
    /// Rejected records are returned as conflicts and skipped by rules.
    pub(crate) fn apply_envelope(&mut self, envelope: &DeltaEnvelope) -> Vec<PublishConflict> {
        let publisher = envelope.source().unwrap_or("<unknown>").to_string();
        let mut conflicts = Vec::new();
        for (index, record) in envelope.records().iter().enumerate() {
            match self
                .membership
                .apply(record, &publisher, envelope.trace_for(index))
            {
                Ok(()) => self.run_rules(|rule, cx| rule.on_record(record, cx)),
                Err(conflict) => {
                    warn!(store = %self.name, %conflict, "publish conflict");
                    conflicts.push(conflict);
                }
            }
        }
        self.run_rules(|rule, cx| rule.on_envelope(envelope, cx));
        conflicts
    }

    pub(crate) fn receive_message(&mut self, message: &DirectiveMessage) {
        debug!(
            store = %self.name,
            from = %message.source,
            directives = message.directives.len(),
            "message received"
        );
        self.run_rules(|rule, cx| rule.on_message(message, cx));
    }

    pub(crate) fn restart(&mut self, peer: &MessageAddress) {
        info!(store = %self.name, %peer, "peer restarted");
        self.run_rules(|rule, cx| rule.on_restart(peer, cx));
    }

    /// Re-resolve `groups` and tell rules about the ones that moved
    pub(crate) fn refresh_addresses(&mut self, groups: &[GroupAddress]) -> usize {
        let changed = self.addresses.refresh(groups);
        for (group, translation) in &changed {
            self.run_rules(|rule, cx| rule.on_address_change(group, translation, cx));
        }
        changed.len()
    }

    /// Run `hook` for every rule; failures and panics are logged and skipped
    fn run_rules<F>(&mut self, mut hook: F)
    where
        F: FnMut(&dyn DomainRule, &mut RuleContext<'_>) -> std::result::Result<(), RuleError>,
    {
        let rules = self.rules.clone();
        for rule in &rules {
            let mut cx = RuleContext { store: self };
            match panic::catch_unwind(AssertUnwindSafe(|| hook(rule.as_ref(), &mut cx))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(store = %self.name, rule = rule.name(), %err, "rule failed, continuing");
                }
                Err(payload) => {
                    error!(
                        store = %self.name,
                        rule = rule.name(),
                        panic = panic_message(payload.as_ref()),
                        "rule panicked, continuing"
                    );
                }
            }
        }
    }

    /// Output produced by rules since the last call
    pub(crate) fn take_output(&mut self) -> Option<DeltaEnvelope> {
        if self.outbox.is_empty() {
            return None;
        }
        let mut output = mem::take(&mut self.outbox);
        output.set_source(self.name.clone());
        if self.timestamped {
            let now = Utc::now();
            output.set_stamp(EnvelopeStamp {
                session: self.name.clone(),
                opened_at: now,
                closed_at: now,
            });
        }
        Some(output)
    }

    pub(crate) fn take_messages(&mut self) -> Vec<DirectiveMessage> {
        let source = MessageAddress::new(self.name.clone());
        mem::take(&mut self.outgoing)
            .into_iter()
            .map(|(destination, directives)| DirectiveMessage {
                source: source.clone(),
                destination,
                incarnation: self.incarnation,
                directives,
            })
            .collect()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic>"
    }
}

/// What a rule may do while the store is applying a record
pub struct RuleContext<'a> {
    store: &'a mut Store,
}

impl RuleContext<'_> {
    pub fn store_name(&self) -> &str {
        &self.store.name
    }

    fn publisher(&mut self) -> Publisher<'_> {
        Publisher {
            name: &self.store.name,
            outbox: &mut self.store.outbox,
            counters: &mut self.store.counters,
            diagnostics: self.store.diagnostics,
        }
    }

    pub fn publish_add(&mut self, obj: Obj) -> Result<bool> {
        self.publisher().add(obj)
    }

    pub fn publish_remove(&mut self, obj: Obj) -> Result<bool> {
        self.publisher().remove(obj)
    }

    pub fn publish_change(&mut self, obj: Obj, changes: Option<Vec<ChangeReport>>) -> Result<bool> {
        let reports = transaction::merge_change_reports(Vec::new(), changes);
        self.publisher().change(obj, reports)
    }

    pub fn publish_event(&mut self, obj: Obj) -> Result<bool> {
        self.publisher().event(obj)
    }

    /// Current member with this uid, as of the record being applied
    pub fn lookup(&self, uid: &Uid) -> Option<Obj> {
        self.store.get(uid)
    }

    pub fn query(&self, predicate: &dyn Predicate) -> Vec<Obj> {
        self.store.query(predicate)
    }

    pub fn send(&mut self, destination: MessageAddress, directive: Directive) {
        self.store
            .outgoing
            .entry(destination)
            .or_default()
            .push(directive);
    }

    /// Send to every current member of a group, returns how many
    pub fn send_to_group(&mut self, group: &GroupAddress, directive: Directive) -> usize {
        let members = self.resolve(group);
        for member in &members {
            self.send(member.clone(), directive.clone());
        }
        members.len()
    }

    pub fn resolve(&mut self, group: &GroupAddress) -> Vec<MessageAddress> {
        self.store.addresses.resolve(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Record;
    use crate::predicate::Pattern;
    use crate::rules::{OnAdd, RuleError};

    fn store() -> Store {
        Store::new("bb".into(), Arc::new(StaticResolver::new()), 8, false, false, 1)
    }

    fn adding(obj: &Obj) -> DeltaEnvelope {
        let mut envelope = DeltaEnvelope::new();
        envelope.add_object(obj.clone());
        envelope.set_source("s1");
        envelope
    }

    #[test]
    fn test_rules_publish_into_output() {
        let mut store = store();
        store.add_rule(Arc::new(OnAdd::new("allocate", |obj: &Obj, cx: &mut RuleContext<'_>| {
            if obj.kind() == "task" {
                cx.publish_add(Record::new("allocation").into_obj())?;
            }
            Ok(())
        })));
        let conflicts = store.apply_envelope(&adding(&Record::new("task").into_obj()));
        assert!(conflicts.is_empty());
        let output = store.take_output().expect("rule output");
        assert_eq!(output.len(), 1);
        assert_eq!(output.source(), Some("bb"));
        assert!(store.take_output().is_none());
        assert_eq!(store.counters().added, 1);
    }

    #[test]
    fn test_failing_rule_does_not_stop_later_records() {
        let mut store = store();
        store.add_rule(Arc::new(OnAdd::new("flaky", |obj: &Obj, cx: &mut RuleContext<'_>| {
            if obj.kind() == "bad" {
                return Err(RuleError::failed("flaky", "cannot handle bad"));
            }
            cx.publish_event(Record::new("seen").into_obj())?;
            Ok(())
        })));
        let mut envelope = DeltaEnvelope::new();
        envelope.add_object(Record::new("bad").into_obj());
        envelope.add_object(Record::new("good").into_obj());
        store.apply_envelope(&envelope);
        assert_eq!(store.len(), 2);
        assert_eq!(store.take_output().map(|o| o.len()), Some(1));
    }

    #[test]
    fn test_panicking_rule_is_contained() {
        let mut store = store();
        store.add_rule(Arc::new(OnAdd::new("explosive", |obj: &Obj, _: &mut RuleContext<'_>| {
            if obj.kind() == "bad" {
                panic!("cannot handle bad");
            }
            Ok(())
        })));
        store.add_rule(Arc::new(OnAdd::new("count", |_: &Obj, cx: &mut RuleContext<'_>| {
            cx.publish_event(Record::new("tick").into_obj())?;
            Ok(())
        })));
        let mut envelope = DeltaEnvelope::new();
        envelope.add_object(Record::new("bad").into_obj());
        envelope.add_object(Record::new("good").into_obj());
        assert!(store.apply_envelope(&envelope).is_empty());
        assert_eq!(store.len(), 2);
        assert_eq!(store.take_output().map(|o| o.len()), Some(2));
    }

    #[test]
    fn test_output_stamped_when_timestamping() {
        let resolver = Arc::new(StaticResolver::new());
        let mut store = Store::new("bb".into(), resolver, 8, false, true, 1);
        store.add_rule(Arc::new(OnAdd::new("allocate", |_: &Obj, cx: &mut RuleContext<'_>| {
            cx.publish_add(Record::new("allocation").into_obj())?;
            Ok(())
        })));
        store.apply_envelope(&adding(&Record::new("task").into_obj()));
        let output = store.take_output().expect("rule output");
        assert_eq!(output.stamp().map(|s| s.session.as_str()), Some("bb"));
    }

    #[test]
    fn test_conflicting_record_skips_rules() {
        let mut store = store();
        let x = Record::new("task").into_obj();
        store.add_rule(Arc::new(OnAdd::new("count", |_: &Obj, cx: &mut RuleContext<'_>| {
            cx.publish_event(Record::new("tick").into_obj())?;
            Ok(())
        })));
        assert!(store.apply_envelope(&adding(&x)).is_empty());
        store.take_output();
        let conflicts = store.apply_envelope(&adding(&x));
        assert_eq!(conflicts.len(), 1);
        assert!(store.take_output().is_none());
    }

    #[test]
    fn test_messages_grouped_by_destination() {
        let mut store = store();
        {
            let mut cx = RuleContext { store: &mut store };
            cx.send(MessageAddress::new("b"), Directive::new("x", serde_json::json!(1)));
            cx.send(MessageAddress::new("a"), Directive::new("y", serde_json::json!(2)));
            cx.send(MessageAddress::new("b"), Directive::new("z", serde_json::json!(3)));
        }
        let messages = store.take_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].destination, MessageAddress::new("a"));
        assert_eq!(messages[1].directives.len(), 2);
        assert_eq!(messages[1].incarnation, 1);
        assert!(store.take_messages().is_empty());
    }

    #[test]
    fn test_query_and_objects() {
        let mut store = store();
        let mut envelope = DeltaEnvelope::new();
        envelope.add_object(Record::new("task").into_obj());
        envelope.add_object(Record::new("order").into_obj());
        store.apply_envelope(&envelope);
        assert_eq!(store.query(&Pattern::kind("task")).len(), 1);
        assert_eq!(store.objects().len(), 2);
    }
}
