use blackboard_types::{ChangeReport, Uid};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::ViewKind;
use crate::delta::ApplyContext;
use crate::object::Obj;

/// Creation and last-modification time of one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Age tracking derived from the close time of stamped envelopes
///
/// Unstamped envelopes carry no times and are ignored.
#[derive(Debug, Default)]
pub struct TimestampKind {
    entries: HashMap<Uid, Timestamps>,
}

impl TimestampKind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timestamps(&self, uid: &Uid) -> Option<Timestamps> {
        self.entries.get(uid).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ViewKind for TimestampKind {
    fn add(&mut self, obj: &Obj, cx: &ApplyContext<'_>) -> bool {
        let Some(stamp) = cx.stamp else {
            return false;
        };
        self.entries.insert(
            obj.uid(),
            Timestamps {
                created: stamp.closed_at,
                modified: stamp.closed_at,
            },
        );
        true
    }

    fn remove(&mut self, obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        self.entries.remove(&obj.uid()).is_some()
    }

    fn change(&mut self, obj: &Obj, _reports: &[ChangeReport], cx: &ApplyContext<'_>) -> bool {
        match (cx.stamp, self.entries.get_mut(&obj.uid())) {
            (Some(stamp), Some(entry)) => {
                entry.modified = stamp.closed_at;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaEnvelope, EnvelopeStamp};
    use crate::object::Record;
    use crate::predicate::MatchAll;
    use crate::view::{Subscription, View};
    use chrono::Duration;
    use std::sync::Arc;

    #[test]
    fn test_created_and_modified_from_close_time() {
        let view = Subscription::new(Arc::new(MatchAll), TimestampKind::new());
        view.receive(&DeltaEnvelope::initialize(view.id(), vec![]));
        let x = Record::new("task").into_obj();
        let t0 = Utc::now();

        let mut unstamped = DeltaEnvelope::new();
        unstamped.add_object(x.clone());
        assert!(!view.receive(&unstamped));

        let mut added = DeltaEnvelope::new();
        added.add_object(x.clone());
        added.set_stamp(EnvelopeStamp {
            session: "s1".into(),
            opened_at: t0,
            closed_at: t0,
        });
        assert!(view.receive(&added));

        let t1 = t0 + Duration::seconds(5);
        let mut changed = DeltaEnvelope::new();
        changed.change_object(x.clone(), vec![]);
        changed.set_stamp(EnvelopeStamp {
            session: "s1".into(),
            opened_at: t1,
            closed_at: t1,
        });
        assert!(view.receive(&changed));

        let stamps = view.read(|k| k.timestamps(&x.uid())).unwrap();
        assert_eq!(stamps.created, t0);
        assert_eq!(stamps.modified, t1);
    }
}
