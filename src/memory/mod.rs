//! Memory subsystem: slot/scope-addressed records with explicit
//! lifecycle, an append-only event log, proposals, and the duplicate
//! and conflict cluster tables maintained by the background worker.

pub mod predicates;
pub mod query;
pub mod store;

pub use query::{memory_query, MemoryQueryParams};
pub use store::{
    conflict_resolve, conflicts_list, duplicate_resolve, duplicates_list, memory_get,
    memory_propose, memory_retract, memory_review, memory_supersede, memory_write,
};
