//! # Storage Module
//!
//! Persistent layer under the engine: the namespace index, one tuple table
//! per environment, shard placement on disk and the lock-conflict retry
//! shared by all of them.

pub mod namespace;
pub(crate) mod retry;
pub mod shard;
pub mod table;

pub use namespace::NamespaceIndex;
pub use table::{ContentType, Match, RawRecord, TableOptions, TupleStream, TupleTable};
