//! Fan-out ordering, rule re-entry and message plumbing

use blackboard_core::{
    BlackboardConfig, BlackboardError, CollectionView, Coordinator, Directive, DirectiveMessage,
    DomainRule, GroupAddress, LoopbackTransport, MatchAll, MessageAddress, OnAdd, Pattern, Record,
    RuleContext, RuleError, StaticResolver, TimestampKind, Translation,
};
use blackboard_core::{Obj, Publishable};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn test_concurrent_writers_deliver_exactly_once() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 25;

    let coordinator = Coordinator::in_memory("fanout").unwrap();
    let reader = coordinator.session("reader");
    reader.open().unwrap();
    let view = reader.subscribe_incremental(Pattern::kind("item")).unwrap();
    reader.close_transaction().unwrap();
    reader.open().unwrap();
    reader.close_transaction().unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                let session = coordinator.session(format!("writer-{w}"));
                for i in 0..PER_WRITER {
                    session.open().unwrap();
                    let obj = Record::new("item")
                        .with_field("writer", w)
                        .with_field("seq", i)
                        .into_obj();
                    session.publish_add(obj).unwrap();
                    session.close_transaction().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    reader.open().unwrap();
    let added = view.read(|v| v.added());
    assert_eq!(added.len(), WRITERS * PER_WRITER);
    let unique: HashSet<_> = added.iter().map(|obj| obj.uid()).collect();
    assert_eq!(unique.len(), WRITERS * PER_WRITER);
    assert_eq!(view.len(), WRITERS * PER_WRITER);
    reader.close_transaction().unwrap();

    assert_eq!(coordinator.stats().distributed as usize, WRITERS * PER_WRITER);
}

#[test]
fn test_subscribers_apply_add_then_remove_in_order() {
    let coordinator = Coordinator::in_memory("order").unwrap();
    let a = coordinator.session("a");
    let b = coordinator.session("b");
    let writer = coordinator.session("writer");

    let mut views = Vec::new();
    for session in [&a, &b] {
        session.open().unwrap();
        views.push(
            session
                .subscribe(Pattern::kind("step"), CollectionView::new())
                .unwrap(),
        );
        session.close_transaction().unwrap();
    }

    let step = Record::new("step").into_obj();
    writer.open().unwrap();
    writer.publish_add(step.clone()).unwrap();
    writer.close_transaction().unwrap();
    writer.open().unwrap();
    writer.publish_remove(step.clone()).unwrap();
    writer.close_transaction().unwrap();

    for (session, view) in [&a, &b].into_iter().zip(&views) {
        assert_eq!(session.pending_envelopes(), 3);
        session.open().unwrap();
        assert!(view.is_empty());
        session.close_transaction().unwrap();
    }
}

#[test]
fn test_rules_run_to_fixed_point() {
    let coordinator = Coordinator::builder("chain")
        .without_workers()
        .rule(OnAdd::new("next", |obj: &Obj, cx: &mut RuleContext<'_>| {
            let depth = obj
                .as_any()
                .downcast_ref::<Record>()
                .and_then(|r| r.get("depth"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if depth < 3 {
                cx.publish_add(Record::new("link").with_field("depth", depth + 1).into_obj())?;
            }
            Ok(())
        }))
        .start()
        .unwrap();
    let reader = coordinator.session("reader");
    reader.open().unwrap();
    let links = reader.subscribe_collection(Pattern::kind("link")).unwrap();
    reader.close_transaction().unwrap();

    let writer = coordinator.session("writer");
    writer.open().unwrap();
    writer
        .publish_add(Record::new("link").with_field("depth", 0).into_obj())
        .unwrap();
    writer.close_transaction().unwrap();

    assert_eq!(coordinator.with_store(|store| store.len()), 4);
    // the writer's envelope plus one per rule round
    assert_eq!(coordinator.stats().distributed, 4);

    reader.open().unwrap();
    assert_eq!(links.len(), 4);
    reader.close_transaction().unwrap();
}

#[test]
fn test_runaway_rules_reported_as_divergence() {
    let mut config = BlackboardConfig::default();
    config.max_rule_rounds = Some(3);
    let coordinator = Coordinator::builder("runaway")
        .config(config)
        .without_workers()
        .rule(OnAdd::new("echo", |_: &Obj, cx: &mut RuleContext<'_>| {
            cx.publish_add(Record::new("echo").into_obj())?;
            Ok(())
        }))
        .start()
        .unwrap();
    let writer = coordinator.session("writer");

    writer.open().unwrap();
    writer.publish_add(Record::new("seed").into_obj()).unwrap();
    let err = writer.close_transaction().unwrap_err();
    assert!(matches!(err, BlackboardError::RuleDivergence { rounds: 4 }));

    assert_eq!(coordinator.with_store(|store| store.len()), 4);
    assert_eq!(coordinator.stats().open_transactions, 0);
}

struct Recorder {
    messages: Arc<AtomicUsize>,
    restarts: Arc<AtomicUsize>,
    moves: Arc<AtomicUsize>,
}

impl DomainRule for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_message(
        &self,
        message: &DirectiveMessage,
        cx: &mut RuleContext<'_>,
    ) -> Result<(), RuleError> {
        self.messages.fetch_add(1, Ordering::SeqCst);
        for directive in &message.directives {
            cx.publish_add(
                Record::new("directive")
                    .with_field("verb", directive.verb.clone())
                    .into_obj(),
            )?;
        }
        cx.send(
            message.source.clone(),
            Directive::new("ack", json!({"count": message.directives.len()})),
        );
        Ok(())
    }

    fn on_restart(
        &self,
        _peer: &MessageAddress,
        _cx: &mut RuleContext<'_>,
    ) -> Result<(), RuleError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_address_change(
        &self,
        _group: &GroupAddress,
        translation: &Translation,
        _cx: &mut RuleContext<'_>,
    ) -> Result<(), RuleError> {
        if translation.changed() {
            self.moves.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn recorder() -> (Recorder, [Arc<AtomicUsize>; 3]) {
    let counters = [
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
    ];
    let rule = Recorder {
        messages: counters[0].clone(),
        restarts: counters[1].clone(),
        moves: counters[2].clone(),
    };
    (rule, counters)
}

fn message(incarnation: u64, verb: &str) -> DirectiveMessage {
    DirectiveMessage {
        source: MessageAddress::new("peer"),
        destination: MessageAddress::new("messaging"),
        incarnation,
        directives: vec![Directive::new(verb, json!(null))],
    }
}

#[test]
fn test_messages_restart_and_stale_incarnations() {
    let transport = Arc::new(LoopbackTransport::new());
    let (rule, [messages, restarts, _]) = recorder();
    let coordinator = Coordinator::builder("messaging")
        .transport(transport.clone())
        .rule(rule)
        .without_workers()
        .start()
        .unwrap();

    assert_eq!(coordinator.receive_messages(&[message(1, "hello")]).unwrap(), 1);
    assert_eq!(restarts.load(Ordering::SeqCst), 0);

    // the peer came back with a newer incarnation
    assert_eq!(coordinator.receive_messages(&[message(2, "again")]).unwrap(), 1);
    assert_eq!(restarts.load(Ordering::SeqCst), 1);

    // a message from the previous incarnation is dropped
    assert_eq!(coordinator.receive_messages(&[message(1, "late")]).unwrap(), 0);
    assert_eq!(messages.load(Ordering::SeqCst), 2);

    assert_eq!(coordinator.query(&Pattern::kind("directive")).len(), 2);
    let sent = transport.take_sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.destination == MessageAddress::new("peer")));
    assert_eq!(
        transport.known_incarnation(&MessageAddress::new("peer")),
        Some(2)
    );
}

#[test]
fn test_message_output_reaches_sessions() {
    let (rule, _) = recorder();
    let coordinator = Coordinator::builder("inbox")
        .rule(rule)
        .without_workers()
        .start()
        .unwrap();
    let session = coordinator.session("watcher");
    session.open().unwrap();
    let directives = session
        .subscribe_incremental(Pattern::kind("directive"))
        .unwrap();
    session.close_transaction().unwrap();

    coordinator.receive_messages(&[message(1, "ping")]).unwrap();

    session.open().unwrap();
    assert_eq!(directives.read(|v| v.added().len()), 1);
    session.close_transaction().unwrap();
}

#[test]
fn test_address_refresh_notifies_rules() {
    let resolver = Arc::new(StaticResolver::new());
    let group = GroupAddress::new("crew", "pilot");
    resolver.set(group.clone(), vec![MessageAddress::new("amy")]);

    let (rule, [_, _, moves]) = recorder();
    let coordinator = Coordinator::builder("addresses")
        .resolver(resolver.clone())
        .rule(rule)
        .without_workers()
        .start()
        .unwrap();

    assert_eq!(coordinator.resolve(&group), vec![MessageAddress::new("amy")]);

    resolver.set(
        group.clone(),
        vec![MessageAddress::new("amy"), MessageAddress::new("bo")],
    );
    // still served from the cache
    assert_eq!(coordinator.resolve(&group).len(), 1);

    assert_eq!(coordinator.refresh_addresses(&[group.clone()]).unwrap(), 1);
    assert_eq!(moves.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.resolve(&group).len(), 2);

    // nothing moved this time
    assert_eq!(coordinator.refresh_addresses(&[group.clone()]).unwrap(), 0);
    assert_eq!(moves.load(Ordering::SeqCst), 1);
}

#[test]
fn test_group_change_without_workers_invalidates_cache() {
    let resolver = Arc::new(StaticResolver::new());
    let group = GroupAddress::new("crew", "cook");
    resolver.set(group.clone(), vec![MessageAddress::new("cy")]);
    let coordinator = Coordinator::builder("invalidate")
        .resolver(resolver.clone())
        .without_workers()
        .start()
        .unwrap();

    assert_eq!(coordinator.resolve(&group).len(), 1);
    resolver.set(group.clone(), vec![]);
    coordinator.notify_group_changed(group.clone());
    assert!(coordinator.resolve(&group).is_empty());
}

#[test]
fn test_rule_output_is_timestamped() {
    let mut config = BlackboardConfig::default();
    config.timestamp_envelopes = true;
    let coordinator = Coordinator::builder("stamped")
        .config(config)
        .without_workers()
        .rule(OnAdd::new("allocate", |obj: &Obj, cx: &mut RuleContext<'_>| {
            if obj.kind() == "task" {
                cx.publish_add(Record::new("allocation").into_obj())?;
            }
            Ok(())
        }))
        .start()
        .unwrap();
    let writer = coordinator.session("writer");
    let reader = coordinator.session("reader");

    reader.open().unwrap();
    let ages = reader.subscribe(MatchAll, TimestampKind::new()).unwrap();
    reader.close_transaction().unwrap();

    writer.open().unwrap();
    writer.publish_add(Record::new("task").into_obj()).unwrap();
    writer.close_transaction().unwrap();

    reader.open().unwrap();
    assert_eq!(coordinator.with_store(|store| store.len()), 2);
    assert_eq!(ages.read(|kind| kind.len()), 2);
    let allocation = coordinator.query(&Pattern::kind("allocation"))[0].uid();
    assert!(ages.read(|kind| kind.timestamps(&allocation)).is_some());
    reader.close_transaction().unwrap();
}
