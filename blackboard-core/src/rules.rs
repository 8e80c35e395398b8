//! Domain rules
//!
//! Rules react to what the store applies and may publish further
//! records through their [`RuleContext`]. The coordinator keeps applying
//! the store's output until no rule produces anything more.

use blackboard_types::{GroupAddress, MessageAddress};
use thiserror::Error;

use crate::delta::{DeltaEnvelope, DeltaRecord};
use crate::error::BlackboardError;
use crate::messaging::DirectiveMessage;
use crate::object::Obj;
use crate::store::{RuleContext, Translation};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {rule} failed: {message}")]
    Failed { rule: String, message: String },

    #[error("rule publish failed: {0}")]
    Publish(#[from] BlackboardError),
}

impl RuleError {
    pub fn failed(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            rule: rule.into(),
            message: message.into(),
        }
    }
}

/// Business logic attached to a store
///
/// Every hook defaults to doing nothing. A failing hook is logged and
/// the store moves on to the next record.
pub trait DomainRule: Send + Sync {
    fn name(&self) -> &str;

    fn on_record(&self, _record: &DeltaRecord, _cx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        Ok(())
    }

    /// Called once per applied envelope, after its records
    fn on_envelope(
        &self,
        _envelope: &DeltaEnvelope,
        _cx: &mut RuleContext<'_>,
    ) -> Result<(), RuleError> {
        Ok(())
    }

    fn on_message(
        &self,
        _message: &DirectiveMessage,
        _cx: &mut RuleContext<'_>,
    ) -> Result<(), RuleError> {
        Ok(())
    }

    /// A peer agent restarted
    fn on_restart(
        &self,
        _peer: &MessageAddress,
        _cx: &mut RuleContext<'_>,
    ) -> Result<(), RuleError> {
        Ok(())
    }

    fn on_address_change(
        &self,
        _group: &GroupAddress,
        _translation: &Translation,
        _cx: &mut RuleContext<'_>,
    ) -> Result<(), RuleError> {
        Ok(())
    }
}

/// Rule that reacts to newly added objects only
///
/// Bulk records from fills and rehydration are not "new" and never reach
/// the handler.
pub struct OnAdd<F> {
    name: String,
    handler: F,
}

impl<F> OnAdd<F>
where
    F: Fn(&Obj, &mut RuleContext<'_>) -> Result<(), RuleError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl<F> DomainRule for OnAdd<F>
where
    F: Fn(&Obj, &mut RuleContext<'_>) -> Result<(), RuleError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_record(&self, record: &DeltaRecord, cx: &mut RuleContext<'_>) -> Result<(), RuleError> {
        match record {
            DeltaRecord::Add(obj) => (self.handler)(obj, cx),
            _ => Ok(()),
        }
    }
}
