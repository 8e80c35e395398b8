//! Blackboard - transactional shared-state engine
//!
//! Many cooperating agents share one in-memory blackboard. Each agent
//! works through a session: it opens a transaction, reads its views,
//! publishes changes into an outbox and closes. The coordinator applies
//! every committed envelope to the store, lets domain rules react, and
//! fans the result out to all sessions in one global order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Coordinator                          │
//! │  (admission barrier, distribution lock, snapshot workers)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │   ┌───────────────────────────────┐    ┌────────────────┐   │
//! │   │            Store              │───▶│  Persistence   │   │
//! │   │  membership · domain rules    │    │ (epoch, inbox) │   │
//! │   │  address cache · messages     │    └────────────────┘   │
//! │   └───────────────┬───────────────┘                         │
//! │                   │ DeltaEnvelope (fan-out)                 │
//! │        ┌──────────┴──────────┬─────────────────┐            │
//! │        ▼                     ▼                 ▼            │
//! │  ┌────────────┐        ┌────────────┐    ┌────────────┐     │
//! │  │ Session A  │        │ Session B  │    │ Session C  │ ... │
//! │  │ inbox ring │        │ inbox ring │    │ inbox ring │     │
//! │  │ ┌────────┐ │        │ ┌────────┐ │    │ ┌────────┐ │     │
//! │  │ │ Views  │ │        │ │ Views  │ │    │ │ Views  │ │     │
//! │  │ └────────┘ │        │ └────────┘ │    │ └────────┘ │     │
//! │  └────────────┘        └────────────┘    └────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! ## Envelopes
//!
//! A [`DeltaEnvelope`] is the ordered list of records one transaction
//! produced: adds, removes, changes with their change reports, events,
//! and bulk fills. Bulk records only ever come from initial view fills
//! and rehydration, so rules reacting to new facts ignore them.
//!
//! ## Views
//!
//! A view pairs a predicate with a kind: a plain collection, an
//! incremental collection tracking added/removed/changed sets, a sorted
//! list, an event trigger or a timestamp index. Views only change when
//! their session opens a transaction, so between open and close they
//! are a stable picture of the store.
//!
//! ## Snapshots
//!
//! Eager snapshots wait for open transactions to drain; lazy snapshots
//! run on the close that drains them. A restarted store rebuilds its
//! membership from the saved baseline, and resuming sessions get views
//! identical to those a never-restarted agent would hold.
//!
//! # Example
//!
//! ```rust,ignore
//! use blackboard_core::{Coordinator, Pattern, Record};
//!
//! let coordinator = Coordinator::in_memory("tasks")?;
//! let planner = coordinator.session("planner");
//! let worker = coordinator.session("worker");
//!
//! // Subscriptions are made inside a transaction and filled on the next open
//! worker.open()?;
//! let open_tasks = worker.subscribe_incremental(Pattern::kind("task"))?;
//! worker.close_transaction()?;
//!
//! {
//!     let tx = planner.transaction()?;
//!     planner.publish_add(Record::new("task").with_field("title", "index").into_obj())?;
//!     tx.commit()?;
//! }
//!
//! worker.open()?;
//! assert_eq!(open_tasks.read(|view| view.added().len()), 1);
//! worker.close_transaction()?;
//! ```

// Modules
pub mod config;
pub mod container;
pub mod coordinator;
pub mod delta;
pub mod error;
pub mod messaging;
pub mod object;
pub mod persistence;
pub mod predicate;
pub mod rules;
pub mod session;
pub mod store;
pub mod transaction;
pub mod types;
pub mod view;
pub mod worker;

// Re-exports for convenience
pub use blackboard_types::{ChangeReport, GroupAddress, MessageAddress, Uid};
pub use config::{AddressConfig, BlackboardConfig, ConfigError, SnapshotConfig, SnapshotMode};
pub use container::{Container, HashContainer, ListContainer};
pub use coordinator::{Coordinator, CoordinatorBuilder, CoordinatorStats};
pub use delta::{DeltaEnvelope, DeltaRecord, EnvelopeStamp, EnvelopeTarget, RecordKind};
pub use error::{
    BlackboardError, ClaimError, ConflictKind, PersistenceError, PublishConflict, Result,
    UsageError,
};
pub use messaging::{
    AckMessage, Directive, DirectiveMessage, LoopbackTransport, MessageTransport, NullTransport,
    ReceiveFlags,
};
pub use object::{downcast, ActiveObject, Claim, Obj, Publishable, Record};
pub use persistence::{MemoryPersistence, Persistence, PersistenceReport, SessionState, Snapshot};
pub use predicate::{MatchAll, Pattern, Predicate, SharedPredicate};
pub use rules::{DomainRule, OnAdd, RuleError};
pub use session::{PublishCounters, Session, TransactionScope};
pub use store::{AddressResolver, RuleContext, StaticResolver, Store, Translation};
pub use types::{SessionId, ViewId};
pub use view::{
    CollectionView, EventKind, IncrementalView, QueryKind, Sorted, Subscription, TimestampKind,
    View, ViewKind,
};
