use blackboard_types::ChangeReport;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use super::ViewKind;
use crate::delta::ApplyContext;
use crate::object::Obj;
use crate::rules::RuleError;

pub type Trigger = Arc<dyn Fn(&Obj) -> Result<(), RuleError> + Send + Sync>;

/// Forwards matching added objects and events to a trigger
///
/// Nothing is materialized. A failing trigger is logged and the next
/// object is still forwarded.
pub struct EventKind {
    trigger: Trigger,
    fired: u64,
}

impl EventKind {
    pub fn new<F>(trigger: F) -> Self
    where
        F: Fn(&Obj) -> Result<(), RuleError> + Send + Sync + 'static,
    {
        Self {
            trigger: Arc::new(trigger),
            fired: 0,
        }
    }

    /// Number of objects forwarded so far
    pub fn fired(&self) -> u64 {
        self.fired
    }

    fn forward(&mut self, obj: &Obj) {
        self.fired += 1;
        if let Err(err) = (self.trigger)(obj) {
            warn!(uid = %obj.uid(), ?err, "event trigger failed");
        }
    }
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventKind").field("fired", &self.fired).finish()
    }
}

impl ViewKind for EventKind {
    fn add(&mut self, obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        self.forward(obj);
        false
    }

    fn remove(&mut self, _obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        false
    }

    fn change(&mut self, _obj: &Obj, _reports: &[ChangeReport], _cx: &ApplyContext<'_>) -> bool {
        false
    }

    fn event(&mut self, obj: &Obj, _cx: &ApplyContext<'_>) -> bool {
        self.forward(obj);
        false
    }

    fn wakes_owner(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaEnvelope;
    use crate::object::Record;
    use crate::predicate::Pattern;
    use crate::view::{Subscription, View};
    use parking_lot::Mutex;

    #[test]
    fn test_forwards_adds_and_events_and_survives_errors() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let view = Subscription::new(
            Pattern::kind("alert").shared(),
            EventKind::new(move |obj: &Obj| {
                sink.lock().push(obj.uid());
                if sink.lock().len() == 1 {
                    return Err(RuleError::failed("trigger", "first one fails"));
                }
                Ok(())
            }),
        );
        view.receive(&DeltaEnvelope::initialize(view.id(), vec![]));

        let a = Record::new("alert").into_obj();
        let b = Record::new("alert").into_obj();
        let other = Record::new("task").into_obj();
        let mut envelope = DeltaEnvelope::new();
        envelope.add_object(a.clone());
        envelope.event(b.clone());
        envelope.event(other);
        envelope.remove_object(a.clone());

        assert!(!view.receive(&envelope));
        assert_eq!(*seen.lock(), vec![a.uid(), b.uid()]);
        assert_eq!(view.read(|k| k.fired()), 2);
    }
}
