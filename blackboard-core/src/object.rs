//! Published objects and their optional capabilities
//!
//! Anything placed on a blackboard implements [`Publishable`]. Two
//! capabilities are opt-in: an [`ActiveObject`] hook that may veto a
//! publish, and a [`Claim`] marking exclusive ownership while the object
//! is a member.

use blackboard_types::{ChangeReport, Uid};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::ClaimError;
use crate::transaction;

/// Shared handle to a published object
pub type Obj = Arc<dyn Publishable>;

/// An object that can be published to a blackboard
pub trait Publishable: Any + Send + Sync + fmt::Debug {
    /// Identity used for membership
    fn uid(&self) -> Uid;

    /// Short type tag used by patterns and diagnostics
    fn kind(&self) -> &str {
        "object"
    }

    fn as_any(&self) -> &dyn Any;

    /// Veto hooks consulted before every publish
    fn active(&self) -> Option<&dyn ActiveObject> {
        None
    }

    /// Exclusive claim staked on add and released on remove
    fn claim(&self) -> Option<&Claim> {
        None
    }
}

/// Hooks a published object may implement to veto publishes
///
/// Returning `false` means the operation does not happen. This is a
/// normal outcome, not an error.
pub trait ActiveObject: Send + Sync {
    fn adding_to_store(&self, _session: &str) -> bool {
        true
    }

    fn changing_in_store(&self, _session: &str) -> bool {
        true
    }

    fn removing_from_store(&self, _session: &str) -> bool {
        true
    }
}

/// Downcast a published object to its concrete type
pub fn downcast<T: Publishable>(obj: &Obj) -> Option<&T> {
    obj.as_any().downcast_ref::<T>()
}

/// Infrastructure-only ownership marker
///
/// Staked by the session that adds the object and released by the one
/// that removes it. Clients never call these directly.
#[derive(Debug, Default)]
pub struct Claim {
    owner: Mutex<Option<String>>,
}

impl Claim {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    pub fn is_claimed(&self) -> bool {
        self.owner.lock().is_some()
    }

    pub(crate) fn stake(&self, uid: Uid, claimant: &str) -> Result<(), ClaimError> {
        let mut owner = self.owner.lock();
        match owner.as_deref() {
            Some(current) if current != claimant => Err(ClaimError::AlreadyClaimed {
                uid,
                owner: current.to_string(),
                claimant: claimant.to_string(),
            }),
            _ => {
                *owner = Some(claimant.to_string());
                Ok(())
            }
        }
    }

    pub(crate) fn release(&self, uid: Uid, claimant: &str) -> Result<(), ClaimError> {
        let mut owner = self.owner.lock();
        match owner.as_deref() {
            Some(current) if current != claimant => Err(ClaimError::NotClaimant {
                uid,
                owner: current.to_string(),
                claimant: claimant.to_string(),
            }),
            _ => {
                *owner = None;
                Ok(())
            }
        }
    }
}

/// General purpose published object: a kind tag plus JSON fields
///
/// Field updates through [`Record::set`] note a change report on the
/// calling thread's open transaction, so a later `publish_change`
/// carries them automatically.
#[derive(Debug)]
pub struct Record {
    uid: Uid,
    kind: String,
    fields: RwLock<Map<String, Value>>,
    claim: Option<Claim>,
}

impl Record {
    pub fn new(kind: impl Into<String>) -> Self {
        Self::with_uid(Uid::new(), kind)
    }

    pub fn with_uid(uid: Uid, kind: impl Into<String>) -> Self {
        Self {
            uid,
            kind: kind.into(),
            fields: RwLock::new(Map::new()),
            claim: None,
        }
    }

    /// Builder-style field initialisation, does not note change reports
    pub fn with_field(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.write().insert(name.into(), value.into());
        self
    }

    /// Give the record an exclusive claim
    pub fn claimable(mut self) -> Self {
        self.claim = Some(Claim::new());
        self
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.fields.read().get(name).cloned()
    }

    pub fn fields(&self) -> Map<String, Value> {
        self.fields.read().clone()
    }

    /// Update a field and note the change on the current transaction
    ///
    /// Returns the previous value.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Option<Value> {
        let previous = self.fields.write().insert(name.to_string(), value.into());
        transaction::note_change_report(self.uid, ChangeReport::field(name, previous.clone()));
        previous
    }

    pub fn into_obj(self) -> Obj {
        Arc::new(self)
    }
}

impl Publishable for Record {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn claim(&self) -> Option<&Claim> {
        self.claim.as_ref()
    }
}
