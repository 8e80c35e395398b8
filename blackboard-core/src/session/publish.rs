use blackboard_types::ChangeReport;
use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::sync::Arc;
use tracing::debug;

use crate::delta::DeltaEnvelope;
use crate::error::Result;
use crate::object::Obj;

/// Running totals of what a session has published
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishCounters {
    pub added: u64,
    pub removed: u64,
    pub changed: u64,
    pub events: u64,
    pub vetoed: u64,
}

/// Appends publishes to an outbox after hooks and claims agree
pub(crate) struct Publisher<'a> {
    pub(crate) name: &'a str,
    pub(crate) outbox: &'a mut DeltaEnvelope,
    pub(crate) counters: &'a mut PublishCounters,
    pub(crate) diagnostics: bool,
}

impl Publisher<'_> {
    pub(crate) fn add(&mut self, obj: Obj) -> Result<bool> {
        if let Some(active) = obj.active() {
            if !active.adding_to_store(self.name) {
                return Ok(self.vetoed(&obj, "add"));
            }
        }
        if let Some(claim) = obj.claim() {
            claim.stake(obj.uid(), self.name)?;
        }
        self.outbox.add_object(obj);
        self.counters.added += 1;
        self.trace();
        Ok(true)
    }

    pub(crate) fn remove(&mut self, obj: Obj) -> Result<bool> {
        if let Some(active) = obj.active() {
            if !active.removing_from_store(self.name) {
                return Ok(self.vetoed(&obj, "remove"));
            }
        }
        if let Some(claim) = obj.claim() {
            claim.release(obj.uid(), self.name)?;
        }
        self.outbox.remove_object(obj);
        self.counters.removed += 1;
        self.trace();
        Ok(true)
    }

    pub(crate) fn change(&mut self, obj: Obj, reports: Vec<ChangeReport>) -> Result<bool> {
        if let Some(active) = obj.active() {
            if !active.changing_in_store(self.name) {
                return Ok(self.vetoed(&obj, "change"));
            }
        }
        self.outbox.change_object(obj, reports);
        self.counters.changed += 1;
        self.trace();
        Ok(true)
    }

    pub(crate) fn event(&mut self, obj: Obj) -> Result<bool> {
        self.outbox.event(obj);
        self.counters.events += 1;
        Ok(true)
    }

    fn vetoed(&mut self, obj: &Obj, operation: &str) -> bool {
        debug!(session = self.name, uid = %obj.uid(), operation, "publish vetoed by object");
        self.counters.vetoed += 1;
        false
    }

    fn trace(&mut self) {
        if self.diagnostics {
            self.outbox.push_trace(Arc::new(Backtrace::force_capture()));
        }
    }
}
