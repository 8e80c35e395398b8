//! View predicates
//!
//! Any `Fn(&Obj) -> bool` closure is a [`Predicate`]. [`Pattern`] is a
//! serializable alternative for predicates over [`Record`]s that need to
//! be described in configuration or logged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::object::{downcast, Obj, Record};

/// Pure membership test over published objects
pub trait Predicate: Send + Sync {
    fn matches(&self, obj: &Obj) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Obj) -> bool + Send + Sync,
{
    fn matches(&self, obj: &Obj) -> bool {
        self(obj)
    }
}

pub type SharedPredicate = Arc<dyn Predicate>;

/// Matches every object; the store's predicate
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

impl Predicate for MatchAll {
    fn matches(&self, _obj: &Obj) -> bool {
        true
    }
}

/// Declarative predicate over object kinds and record fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum Pattern {
    Any,
    Kind { kind: String },
    Field { name: String, value: Value },
    Exists { name: String },
    All { patterns: Vec<Pattern> },
    AnyOf { patterns: Vec<Pattern> },
    Not { pattern: Box<Pattern> },
}

impl Pattern {
    pub fn any() -> Self {
        Self::Any
    }

    pub fn kind(kind: impl Into<String>) -> Self {
        Self::Kind { kind: kind.into() }
    }

    /// Record field equals `value`
    pub fn field(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Field {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn exists(name: impl Into<String>) -> Self {
        Self::Exists { name: name.into() }
    }

    pub fn and(self, other: Pattern) -> Self {
        match self {
            Self::All { mut patterns } => {
                patterns.push(other);
                Self::All { patterns }
            }
            first => Self::All {
                patterns: vec![first, other],
            },
        }
    }

    pub fn or(self, other: Pattern) -> Self {
        match self {
            Self::AnyOf { mut patterns } => {
                patterns.push(other);
                Self::AnyOf { patterns }
            }
            first => Self::AnyOf {
                patterns: vec![first, other],
            },
        }
    }

    pub fn negate(self) -> Self {
        Self::Not {
            pattern: Box::new(self),
        }
    }

    pub fn shared(self) -> SharedPredicate {
        Arc::new(self)
    }
}

impl Predicate for Pattern {
    fn matches(&self, obj: &Obj) -> bool {
        match self {
            Self::Any => true,
            Self::Kind { kind } => obj.kind() == kind,
            Self::Field { name, value } => downcast::<Record>(obj)
                .and_then(|record| record.get(name))
                .is_some_and(|actual| &actual == value),
            Self::Exists { name } => {
                downcast::<Record>(obj).is_some_and(|record| record.get(name).is_some())
            }
            Self::All { patterns } => patterns.iter().all(|p| p.matches(obj)),
            Self::AnyOf { patterns } => patterns.iter().any(|p| p.matches(obj)),
            Self::Not { pattern } => !pattern.matches(obj),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "_"),
            Self::Kind { kind } => write!(f, "kind={}", kind),
            Self::Field { name, value } => write!(f, "{}={}", name, value),
            Self::Exists { name } => write!(f, "{}?", name),
            Self::All { patterns } => write_joined(f, patterns, " & "),
            Self::AnyOf { patterns } => write_joined(f, patterns, " | "),
            Self::Not { pattern } => write!(f, "!({})", pattern),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, patterns: &[Pattern], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, pattern) in patterns.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", pattern)?;
    }
    write!(f, ")")
}
