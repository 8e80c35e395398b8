use blackboard_types::Uid;
use chrono::Utc;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::delta::DeltaRecord;
use crate::error::{ConflictKind, PriorPublisher, PublishConflict};
use crate::object::Obj;

/// Authoritative member set of a blackboard
///
/// Double adds and removes of non-members are always rejected. With
/// diagnostics on, the last publisher of every object is remembered so
/// the conflict can name it.
#[derive(Debug, Default)]
pub(crate) struct Membership {
    objects: HashMap<Uid, Obj>,
    history: Option<HashMap<Uid, PriorPublisher>>,
}

impl Membership {
    pub(crate) fn new(diagnostics: bool) -> Self {
        Self {
            objects: HashMap::new(),
            history: diagnostics.then(HashMap::new),
        }
    }

    pub(crate) fn apply(
        &mut self,
        record: &DeltaRecord,
        publisher: &str,
        trace: Option<&Arc<Backtrace>>,
    ) -> Result<(), PublishConflict> {
        match record {
            DeltaRecord::Add(obj) => {
                if self.objects.contains_key(&obj.uid()) {
                    return Err(self.conflict(ConflictKind::DoubleAdd, obj, publisher));
                }
                self.objects.insert(obj.uid(), obj.clone());
                self.remember(obj, publisher, trace);
            }
            DeltaRecord::Remove(obj) => {
                if self.objects.remove(&obj.uid()).is_none() {
                    return Err(self.conflict(ConflictKind::RemoveNonMember, obj, publisher));
                }
                self.remember(obj, publisher, trace);
            }
            DeltaRecord::Change(obj, _) => {
                if !self.objects.contains_key(&obj.uid()) {
                    warn!(
                        uid = %obj.uid(),
                        kind = obj.kind(),
                        publisher,
                        "change of an object that is not on the blackboard"
                    );
                }
            }
            DeltaRecord::Bulk(objects) => {
                for obj in objects.iter() {
                    if self.objects.insert(obj.uid(), obj.clone()).is_some() {
                        warn!(uid = %obj.uid(), "bulk record repeats a member");
                    }
                }
            }
            DeltaRecord::Event(_) => {}
        }
        Ok(())
    }

    fn remember(&mut self, obj: &Obj, publisher: &str, trace: Option<&Arc<Backtrace>>) {
        if let Some(history) = &mut self.history {
            history.insert(
                obj.uid(),
                PriorPublisher {
                    session: publisher.to_string(),
                    at: Utc::now(),
                    stack: trace.cloned(),
                },
            );
        }
    }

    fn conflict(&self, kind: ConflictKind, obj: &Obj, publisher: &str) -> PublishConflict {
        PublishConflict {
            kind,
            uid: obj.uid(),
            object: format!("{:?}", obj),
            publisher: publisher.to_string(),
            prior: self
                .history
                .as_ref()
                .and_then(|history| history.get(&obj.uid()))
                .cloned(),
        }
    }

    pub(crate) fn get(&self, uid: &Uid) -> Option<&Obj> {
        self.objects.get(uid)
    }

    pub(crate) fn contains(&self, uid: &Uid) -> bool {
        self.objects.contains_key(uid)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Obj> {
        self.objects.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }
}
