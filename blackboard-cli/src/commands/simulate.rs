use anyhow::{anyhow, Result};
use blackboard_core::{
    BlackboardConfig, Coordinator, CoordinatorStats, LoopbackTransport, MemoryPersistence, Obj,
    OnAdd, Pattern, Publishable, Record, RuleContext, Session,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

use super::load_config;

pub struct SimulateOptions {
    pub sessions: usize,
    pub transactions: usize,
    pub restart: bool,
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    sessions: usize,
    transactions: usize,
    elapsed_ms: u128,
    tasks: usize,
    allocations: usize,
    observed_added: usize,
    observed_removed: usize,
    observed_changed: usize,
    view_matches_store: bool,
    stats: CoordinatorStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    restart: Option<RestartReport>,
}

#[derive(Debug, Serialize)]
struct RestartReport {
    restored_objects: usize,
    resumed_view: usize,
    consistent: bool,
}

fn start(config: &BlackboardConfig, persistence: &Arc<MemoryPersistence>) -> Result<Coordinator> {
    let coordinator = Coordinator::builder("simulation")
        .config(config.clone())
        .persistence(persistence.clone())
        .transport(Arc::new(LoopbackTransport::new()))
        .rule(OnAdd::new(
            "allocate",
            |obj: &Obj, cx: &mut RuleContext<'_>| {
                if obj.kind() == "task" {
                    let allocation = Record::new("allocation")
                        .with_field("task", obj.uid().to_string())
                        .into_obj();
                    cx.publish_add(allocation)?;
                }
                Ok(())
            },
        ))
        .start()?;
    Ok(coordinator)
}

/// One writer's workload: add a task per transaction, close every third
/// and drop the oldest every fifth
fn run_writer(session: Session, transactions: usize) -> Result<()> {
    let mut live: Vec<Arc<Record>> = Vec::new();
    for seq in 0..transactions {
        let tx = session.transaction()?;
        let task = Arc::new(
            Record::new("task")
                .with_field("writer", session.name())
                .with_field("seq", seq)
                .with_field("status", "open"),
        );
        session.publish_add(task.clone())?;
        live.push(task);

        if seq % 3 == 2 {
            if let Some(task) = live.last() {
                task.set("status", "done");
                session.publish_change(task.clone(), None)?;
            }
        }
        if seq % 5 == 4 && !live.is_empty() {
            let oldest = live.remove(0);
            session.publish_remove(oldest)?;
        }
        tx.commit()?;
    }
    debug!(session = session.name(), remaining = live.len(), "writer finished");
    Ok(())
}

pub fn simulate(config_path: Option<&Path>, opts: SimulateOptions) -> Result<()> {
    let config = load_config(config_path)?;
    let persistence = Arc::new(MemoryPersistence::new());
    let coordinator = start(&config, &persistence)?;
    let started = Instant::now();

    let observer = coordinator.session("observer");
    observer.open()?;
    let tasks = observer.subscribe_incremental(Pattern::kind("task"))?;
    observer.close_transaction()?;
    // consume the fill so the counters below only see the writers' work
    observer.open()?;
    observer.close_transaction()?;

    let handles: Vec<_> = (0..opts.sessions)
        .map(|i| {
            let session = coordinator.session(format!("writer-{i}"));
            let transactions = opts.transactions;
            thread::spawn(move || run_writer(session, transactions))
        })
        .collect();
    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow!("writer thread panicked"))??;
    }

    let scope = observer.transaction()?;
    let (observed_added, observed_removed, observed_changed) = tasks.read(|view| {
        (view.added().len(), view.removed().len(), view.changed().len())
    });
    let store_tasks = coordinator.query(&Pattern::kind("task")).len();
    let view_matches_store = tasks.len() == store_tasks;
    scope.commit()?;

    let allocations = coordinator.query(&Pattern::kind("allocation")).len();
    coordinator.snapshot(false, false)?;
    let stats = coordinator.stats();
    info!(distributed = stats.distributed, objects = stats.objects, "simulation finished");

    let restart = if opts.restart {
        coordinator.shutdown();
        drop(tasks);
        drop(observer);
        drop(coordinator);
        Some(restart_and_verify(&config, &persistence)?)
    } else {
        coordinator.shutdown();
        None
    };

    let report = SimulationReport {
        sessions: opts.sessions,
        transactions: opts.transactions,
        elapsed_ms: started.elapsed().as_millis(),
        tasks: store_tasks,
        allocations,
        observed_added,
        observed_removed,
        observed_changed,
        view_matches_store,
        stats,
        restart,
    };

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if !report.view_matches_store || report.restart.as_ref().is_some_and(|r| !r.consistent) {
        return Err(anyhow!("observer view diverged from the store"));
    }
    Ok(())
}

fn restart_and_verify(
    config: &BlackboardConfig,
    persistence: &Arc<MemoryPersistence>,
) -> Result<RestartReport> {
    let coordinator = start(config, persistence)?;
    let restored_objects = coordinator.with_store(|store| store.len());

    let observer = coordinator.session("observer");
    observer.open()?;
    let tasks = observer.subscribe_collection(Pattern::kind("task"))?;
    observer.close_transaction()?;

    observer.open()?;
    let resumed_view = tasks.len();
    let consistent = resumed_view == coordinator.query(&Pattern::kind("task")).len();
    observer.close_transaction()?;
    coordinator.shutdown();

    Ok(RestartReport {
        restored_objects,
        resumed_view,
        consistent,
    })
}

fn print_report(report: &SimulationReport) {
    println!(
        "simulated {} sessions x {} transactions in {}ms",
        report.sessions, report.transactions, report.elapsed_ms
    );
    println!("  tasks:        {}", report.tasks);
    println!("  allocations:  {}", report.allocations);
    println!("  distributed:  {}", report.stats.distributed);
    println!(
        "  observer saw: {} added, {} removed, {} changed",
        report.observed_added, report.observed_removed, report.observed_changed
    );
    println!(
        "  view matches store: {}",
        if report.view_matches_store { "yes" } else { "no" }
    );
    if let Some(restart) = &report.restart {
        println!(
            "restart: restored {} objects, resumed view holds {} tasks ({})",
            restart.restored_objects,
            restart.resumed_view,
            if restart.consistent {
                "consistent"
            } else {
                "INCONSISTENT"
            }
        );
    }
}
