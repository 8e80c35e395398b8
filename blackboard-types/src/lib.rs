//! Shared types for the blackboard engine
//!
//! These are the plain-data identities and annotations that cross the
//! boundary between the engine and its collaborators (persistence,
//! message transport, domain rules).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identity of a published object
///
/// Every object placed on a blackboard carries one. Identity, not value
/// equality, decides membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub Uuid);

impl Uid {
    /// Create a new random uid
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive a stable uid from a name, useful for fixtures
    pub fn named(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u:{}", &self.0.to_string()[..8])
    }
}

/// Address of a remote agent's blackboard
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageAddress(pub String);

impl MessageAddress {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attribute-based address: every agent playing `role` in `community`
///
/// Resolved to concrete [`MessageAddress`]es through the store's
/// address cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupAddress {
    pub community: String,
    pub role: String,
}

impl GroupAddress {
    pub fn new(community: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            community: community.into(),
            role: role.into(),
        }
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.community, self.role)
    }
}

/// Annotation describing how a published object changed
///
/// `Anonymous` means "something changed": consumers must re-evaluate
/// everything they know about the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeReport {
    Anonymous,
    Field {
        name: String,
        previous: Option<serde_json::Value>,
    },
    Note(String),
}

impl ChangeReport {
    /// Report a change of one named field
    pub fn field(name: impl Into<String>, previous: Option<serde_json::Value>) -> Self {
        Self::Field {
            name: name.into(),
            previous,
        }
    }

    pub fn note(text: impl Into<String>) -> Self {
        Self::Note(text.into())
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    /// Name of the changed field, if this report names one
    pub fn field_name(&self) -> Option<&str> {
        match self {
            Self::Field { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => write!(f, "<changed>"),
            Self::Field { name, .. } => write!(f, "field {}", name),
            Self::Note(text) => write!(f, "{}", text),
        }
    }
}
