//! Error types for the blackboard engine

use blackboard_types::Uid;
use chrono::{DateTime, Utc};
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ConfigError;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum BlackboardError {
    /// A client called the API in the wrong state
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    /// Double add or remove of the same object
    #[error("Publish conflict: {0}")]
    Conflict(#[from] PublishConflict),

    #[error("Claim error: {0}")]
    Claim(#[from] ClaimError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Domain rules kept producing output past the configured bound
    #[error("Rules did not reach a fixed point after {rounds} rounds")]
    RuleDivergence { rounds: usize },

    #[error("Coordinator has shut down")]
    CoordinatorGone,

    #[error("Failed to start background worker: {0}")]
    Worker(#[from] std::io::Error),
}

/// Client mistakes in the transaction protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("{operation} called outside an open transaction on session {session}")]
    NotInTransaction {
        operation: &'static str,
        session: String,
    },

    #[error("Transaction on session {session} closed from a thread that does not own it")]
    NotOwner { session: String },

    #[error("Close on session {session} with no open transaction")]
    NotOpen { session: String },

    #[error("Thread already has a transaction bound for session {bound}")]
    ThreadAlreadyBound { bound: String },

    #[error("No transaction bound to this thread for session {session}")]
    TransactionNotBound { session: String },

    #[error("View is not owned by this session")]
    UnknownView,

    #[error("Snapshot requested from inside an open transaction")]
    SnapshotInsideTransaction,
}

/// Which membership rule a publish broke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Add of an object that is already a member
    DoubleAdd,
    /// Remove of an object that is not a member
    RemoveNonMember,
}

/// Who last published an object, kept when diagnostics are enabled
#[derive(Debug, Clone)]
pub struct PriorPublisher {
    pub session: String,
    pub at: DateTime<Utc>,
    pub stack: Option<Arc<Backtrace>>,
}

/// Descriptive membership conflict raised by the store
#[derive(Debug, Clone)]
pub struct PublishConflict {
    pub kind: ConflictKind,
    pub uid: Uid,
    pub object: String,
    pub publisher: String,
    pub prior: Option<PriorPublisher>,
}

impl fmt::Display for PublishConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConflictKind::DoubleAdd => write!(
                f,
                "{} added {} ({}) which is already on the blackboard",
                self.publisher, self.uid, self.object
            )?,
            ConflictKind::RemoveNonMember => write!(
                f,
                "{} removed {} ({}) which is not on the blackboard",
                self.publisher, self.uid, self.object
            )?,
        }
        if let Some(prior) = &self.prior {
            write!(f, "; previously published by {} at {}", prior.session, prior.at)?;
            if let Some(stack) = &prior.stack {
                write!(f, "\nprior publisher stack:\n{}", stack)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for PublishConflict {}

/// Conflicts on an object's exclusive claim
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    #[error("{uid} is already claimed by {owner}, {claimant} cannot claim it")]
    AlreadyClaimed {
        uid: Uid,
        owner: String,
        claimant: String,
    },

    #[error("{claimant} released {uid} but the claim is held by {owner}")]
    NotClaimant {
        uid: Uid,
        owner: String,
        claimant: String,
    },
}

/// Persistence collaborator failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("persistence not enabled")]
    NotEnabled,

    #[error("snapshot write failed: {0}")]
    WriteFailed(String),

    #[error("rehydration failed: {0}")]
    RehydrateFailed(String),
}

/// Result type using BlackboardError
pub type Result<T> = std::result::Result<T, BlackboardError>;
