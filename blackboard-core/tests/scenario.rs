//! End-to-end behaviour of sessions publishing through one coordinator

use blackboard_core::{
    BlackboardConfig, BlackboardError, ChangeReport, ClaimError, Coordinator, ConflictKind, OnAdd,
    Pattern, Publishable, Record, RuleContext, UsageError,
};
use blackboard_core::{ActiveObject, Obj, Uid};
use std::any::Any;
use std::sync::Arc;

fn coordinator() -> Coordinator {
    Coordinator::in_memory("scenario").unwrap()
}

#[test]
fn test_add_reaches_matching_subscribers_only() {
    let coordinator = coordinator();
    let s1 = coordinator.session("s1");
    let s2 = coordinator.session("s2");
    let s3 = coordinator.session("s3");

    s2.open().unwrap();
    let tasks = s2.subscribe_incremental(Pattern::kind("task")).unwrap();
    s2.close_transaction().unwrap();

    s3.open().unwrap();
    let orders = s3.subscribe_incremental(Pattern::kind("order")).unwrap();
    s3.close_transaction().unwrap();

    let x = Record::new("task").with_field("title", "write").into_obj();
    s1.open().unwrap();
    assert!(s1.publish_add(x.clone()).unwrap());
    s1.close_transaction().unwrap();

    s2.open().unwrap();
    assert!(tasks.contains(&x.uid()));
    assert!(tasks.read(|view| view.was_added(&x.uid())));
    assert!(s2.have_collections_changed().unwrap());
    s2.close_transaction().unwrap();

    s3.open().unwrap();
    assert!(orders.is_empty());
    assert!(orders.read(|view| view.added().is_empty()));
    s3.close_transaction().unwrap();
}

#[test]
fn test_views_are_stable_until_next_open() {
    let coordinator = coordinator();
    let writer = coordinator.session("writer");
    let reader = coordinator.session("reader");

    reader.open().unwrap();
    let all = reader.subscribe_collection(Pattern::any()).unwrap();
    reader.close_transaction().unwrap();

    reader.open().unwrap();
    writer.open().unwrap();
    writer.publish_add(Record::new("task").into_obj()).unwrap();
    writer.close_transaction().unwrap();
    assert!(all.is_empty());
    assert_eq!(reader.pending_envelopes(), 1);
    reader.close_transaction().unwrap();

    reader.open().unwrap();
    assert_eq!(all.len(), 1);
    reader.close_transaction().unwrap();
}

#[test]
fn test_subscription_fills_from_existing_members() {
    let coordinator = coordinator();
    let writer = coordinator.session("writer");
    writer.open().unwrap();
    for _ in 0..3 {
        writer.publish_add(Record::new("task").into_obj()).unwrap();
    }
    writer.publish_add(Record::new("order").into_obj()).unwrap();
    writer.close_transaction().unwrap();

    let late = coordinator.session("late");
    late.open().unwrap();
    let tasks = late.subscribe_incremental(Pattern::kind("task")).unwrap();
    late.close_transaction().unwrap();

    late.open().unwrap();
    assert_eq!(tasks.len(), 3);
    // the initial fill is not reported as additions
    assert!(tasks.read(|view| view.added().is_empty()));
    late.close_transaction().unwrap();
}

#[test]
fn test_change_reports_merge_collected_before_supplied() {
    let coordinator = coordinator();
    let writer = coordinator.session("writer");
    let reader = coordinator.session("reader");

    let record = Arc::new(Record::new("task").with_field("status", "open"));
    let obj: Obj = record.clone();

    writer.open().unwrap();
    writer.publish_add(obj.clone()).unwrap();
    writer.close_transaction().unwrap();

    reader.open().unwrap();
    let tasks = reader.subscribe_incremental(Pattern::kind("task")).unwrap();
    reader.close_transaction().unwrap();
    reader.open().unwrap();
    reader.close_transaction().unwrap();

    writer.open().unwrap();
    record.set("status", "done");
    writer
        .publish_change(obj.clone(), Some(vec![ChangeReport::note("by hand")]))
        .unwrap();
    writer.close_transaction().unwrap();

    reader.open().unwrap();
    let reports = tasks.read(|view| view.change_reports(&obj.uid()));
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].field_name(), Some("status"));
    assert_eq!(reports[1], ChangeReport::note("by hand"));
    reader.close_transaction().unwrap();
}

#[test]
fn test_change_without_reports_is_anonymous() {
    let coordinator = coordinator();
    let writer = coordinator.session("writer");
    let reader = coordinator.session("reader");
    let obj = Record::new("task").into_obj();

    writer.open().unwrap();
    writer.publish_add(obj.clone()).unwrap();
    writer.close_transaction().unwrap();

    reader.open().unwrap();
    let tasks = reader.subscribe_incremental(Pattern::kind("task")).unwrap();
    reader.close_transaction().unwrap();
    reader.open().unwrap();
    reader.close_transaction().unwrap();

    writer.open().unwrap();
    writer.publish_change(obj.clone(), None).unwrap();
    writer.close_transaction().unwrap();

    reader.open().unwrap();
    let reports = tasks.read(|view| view.change_reports(&obj.uid()));
    assert_eq!(reports, vec![ChangeReport::Anonymous]);
    reader.close_transaction().unwrap();
}

#[test]
fn test_bulk_fill_does_not_trigger_add_rules() {
    let coordinator = Coordinator::builder("rules")
        .without_workers()
        .rule(OnAdd::new("tag", |obj: &Obj, cx: &mut RuleContext<'_>| {
            if obj.kind() == "task" {
                cx.publish_add(Record::new("tag").into_obj())?;
            }
            Ok(())
        }))
        .start()
        .unwrap();
    let writer = coordinator.session("writer");

    writer.open().unwrap();
    writer.publish_add(Record::new("task").into_obj()).unwrap();
    writer.close_transaction().unwrap();
    assert_eq!(coordinator.query(&Pattern::kind("tag")).len(), 1);

    // a subscription fill carries a bulk record and must not re-fire the rule
    let reader = coordinator.session("reader");
    reader.open().unwrap();
    let _all = reader.subscribe_collection(Pattern::any()).unwrap();
    reader.close_transaction().unwrap();
    reader.open().unwrap();
    reader.close_transaction().unwrap();
    assert_eq!(coordinator.query(&Pattern::kind("tag")).len(), 1);
}

#[derive(Debug)]
struct Guarded {
    uid: Uid,
    allow_remove: bool,
}

impl Publishable for Guarded {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn kind(&self) -> &str {
        "guarded"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn active(&self) -> Option<&dyn ActiveObject> {
        Some(self)
    }
}

impl ActiveObject for Guarded {
    fn removing_from_store(&self, _session: &str) -> bool {
        self.allow_remove
    }
}

#[test]
fn test_veto_is_not_an_error() {
    let coordinator = coordinator();
    let session = coordinator.session("owner");
    let obj: Obj = Arc::new(Guarded {
        uid: Uid::new(),
        allow_remove: false,
    });

    session.open().unwrap();
    assert!(session.publish_add(obj.clone()).unwrap());
    session.close_transaction().unwrap();

    session.open().unwrap();
    assert!(!session.publish_remove(obj.clone()).unwrap());
    session.close_transaction().unwrap();

    assert_eq!(session.counters().vetoed, 1);
    assert!(coordinator.with_store(|store| store.contains(&obj.uid())));
}

#[test]
fn test_claim_conflict_between_sessions() {
    let coordinator = coordinator();
    let first = coordinator.session("first");
    let second = coordinator.session("second");
    let job = Record::new("job").claimable().into_obj();

    first.open().unwrap();
    first.publish_add(job.clone()).unwrap();
    first.close_transaction().unwrap();

    second.open().unwrap();
    let err = second.publish_remove(job.clone()).unwrap_err();
    assert!(matches!(
        err,
        BlackboardError::Claim(ClaimError::NotClaimant { .. })
    ));
    second.close_transaction().unwrap();

    assert_eq!(job.claim().and_then(|c| c.owner()).as_deref(), Some("first"));
}

#[test]
fn test_double_add_reports_conflict_but_still_delivers() {
    let coordinator = coordinator();
    let a = coordinator.session("a");
    let b = coordinator.session("b");
    let obj = Record::new("task").into_obj();

    a.open().unwrap();
    a.publish_add(obj.clone()).unwrap();
    a.close_transaction().unwrap();

    b.open().unwrap();
    b.publish_add(obj.clone()).unwrap();
    let err = b.close_transaction().unwrap_err();
    match err {
        BlackboardError::Conflict(conflict) => {
            assert_eq!(conflict.kind, ConflictKind::DoubleAdd);
            assert_eq!(conflict.publisher, "b");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(coordinator.with_store(|store| store.len()), 1);
    assert!(!b.is_in_transaction());
}

#[test]
fn test_publish_outside_transaction_is_usage_error() {
    let coordinator = coordinator();
    let session = coordinator.session("careless");
    let err = session
        .publish_add(Record::new("task").into_obj())
        .unwrap_err();
    assert!(matches!(
        err,
        BlackboardError::Usage(UsageError::NotInTransaction { .. })
    ));
    assert!(session.subscribe_collection(Pattern::any()).is_err());
    assert!(matches!(
        session.close_transaction(),
        Err(BlackboardError::Usage(UsageError::NotOpen { .. }))
    ));
}

#[test]
fn test_close_from_other_thread_is_refused() {
    let coordinator = coordinator();
    let session = Arc::new(coordinator.session("shared"));
    session.open().unwrap();

    let other = session.clone();
    let result = std::thread::spawn(move || other.close_transaction())
        .join()
        .unwrap();
    assert!(matches!(
        result,
        Err(BlackboardError::Usage(UsageError::NotOwner { .. }))
    ));
    session.close_transaction().unwrap();
}

#[test]
fn test_nested_open_needs_matching_closes() {
    let coordinator = coordinator();
    let session = coordinator.session("nested");

    session.open().unwrap();
    session.open().unwrap();
    session.close_transaction().unwrap();
    assert!(session.is_in_transaction());
    session.close_transaction().unwrap();
    assert!(!session.is_in_transaction());
}

#[test]
fn test_try_open_reports_busy_session() {
    let coordinator = coordinator();
    let session = Arc::new(coordinator.session("busy"));
    session.open().unwrap();

    let other = session.clone();
    let opened = std::thread::spawn(move || other.try_open().unwrap())
        .join()
        .unwrap();
    assert!(!opened);
    session.close_transaction().unwrap();
}

#[test]
fn test_scope_guard_closes_on_drop() {
    let coordinator = coordinator();
    let writer = coordinator.session("writer");
    {
        let _scope = writer.transaction().unwrap();
        writer.publish_add(Record::new("task").into_obj()).unwrap();
    }
    assert!(!writer.is_in_transaction());
    assert_eq!(coordinator.with_store(|store| store.len()), 1);

    let scope = writer.transaction().unwrap();
    writer.publish_add(Record::new("task").into_obj()).unwrap();
    scope.commit().unwrap();
    assert_eq!(coordinator.with_store(|store| store.len()), 2);
}

#[test]
fn test_dropped_session_abandons_outbox() {
    let coordinator = coordinator();
    let session = coordinator.session("quitter");
    session.open().unwrap();
    session.publish_add(Record::new("task").into_obj()).unwrap();
    drop(session);

    assert_eq!(coordinator.with_store(|store| store.len()), 0);
    assert_eq!(coordinator.stats().open_transactions, 0);
    assert_eq!(coordinator.session_count(), 0);
}

#[test]
fn test_conflict_names_prior_publisher_with_diagnostics() {
    let mut config = BlackboardConfig::default();
    config.publish_diagnostics = true;
    let coordinator = Coordinator::builder("diagnosed")
        .config(config)
        .without_workers()
        .start()
        .unwrap();
    let a = coordinator.session("a");
    let b = coordinator.session("b");
    let obj = Record::new("task").into_obj();

    a.open().unwrap();
    a.publish_add(obj.clone()).unwrap();
    a.close_transaction().unwrap();

    b.open().unwrap();
    b.publish_add(obj.clone()).unwrap();
    match b.close_transaction().unwrap_err() {
        BlackboardError::Conflict(conflict) => {
            assert_eq!(conflict.kind, ConflictKind::DoubleAdd);
            assert_eq!(conflict.publisher, "b");
            let prior = conflict.prior.as_ref().expect("prior publisher recorded");
            assert_eq!(prior.session, "a");
            assert!(prior.stack.is_some());
            assert!(conflict.to_string().contains("previously published by a"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_conflict_without_diagnostics_has_no_prior() {
    let coordinator = coordinator();
    let a = coordinator.session("a");
    let b = coordinator.session("b");
    let obj = Record::new("task").into_obj();

    a.open().unwrap();
    a.publish_add(obj.clone()).unwrap();
    a.close_transaction().unwrap();

    b.open().unwrap();
    b.publish_add(obj).unwrap();
    match b.close_transaction().unwrap_err() {
        BlackboardError::Conflict(conflict) => assert!(conflict.prior.is_none()),
        other => panic!("unexpected error: {other}"),
    }
}
