//! # tuplespace-core
//!
//! Persistent, hierarchical tuple-space storage for isolated environments.
//!
//! Each environment is a node of a namespace tree and owns one table of
//! immutable, uniquely identified tuples, queryable by content predicate or
//! by id. The crate covers the storage engine proper:
//!
//! - `storage` - namespace index, per-environment tuple tables, shard
//!   placement, lock-conflict retry
//! - `filter` - query compilation into an executable predicate tree
//! - `admission` - per-store OPEN/READONLY/MOVING/CLOSING/CLOSED gating
//! - `session` - managers (one per bind), query iterators, listen
//! - `transfer` - two-phase clone/move/copy of environment subtrees
//! - `engine` - the service object tying them together
//!
//! ## Architectural Constraints
//!
//! - NO async, NO network: every operation runs on its caller's thread
//! - Transport, lease negotiation and process bootstrap are collaborators
//! - Malformed queries match nothing; they never fail a request
//! - A crash before an accept commits leaves no trace of it

// =============================================================================
// MODULES
// =============================================================================

pub mod admission;
pub mod config;
pub mod engine;
pub mod filter;
pub mod lease;
pub mod primitives;
pub mod query;
pub mod session;
pub mod storage;
pub mod transfer;
pub mod tuple;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{EnvId, EnvironmentDescriptor, ProtectionId, StoreError, TupleId};

pub use tuple::{Field, FieldAccess, FieldView, Tuple, TupleBuilder, TypeRef, Value, ValueCategory};

// =============================================================================
// RE-EXPORTS: Query Engine
// =============================================================================

pub use filter::{Filter, FilterError};
pub use query::{Op, Query};

// =============================================================================
// RE-EXPORTS: Storage Engine
// =============================================================================

pub use admission::{StorePhase, WriteOp, WriteStatus};
pub use config::EngineConfig;
pub use engine::Engine;
pub use lease::{Lease, LeaseId, LeaseService, LocalLeaseService};
pub use session::{IteratorId, Manager, Requester, ResourceDescriptor};
pub use storage::{ContentType, Match, RawRecord, TupleStream};
pub use transfer::{CopySession, CopyTarget, DestSession, SourceSession, TransferMode};
