//! State management module for the Stratus control plane.
//!
//! This module holds the local authoritative inventory: entity types, the
//! store traits consumed by the engines, the in-memory store, and the
//! journal backends that make it durable across restarts.

mod journal;
mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use journal::{JOURNAL_VERSION, JournalBackend, JournalSnapshot, spawn_lease_keeper};
pub use local::LocalJournal;
pub use lock::{KeyedGuard, KeyedLocks, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStore;
pub use s3::S3Journal;
pub use store::{Mutator, ResourceStore, TaskStore};
pub use types::{
    ChangeLogEntry, ChangeSet, DEFAULT_ENTITY_ID, Entity, EntityStatus, FieldChange, LogAction,
    ProviderKind, ResourceKind, ScopeRef,
};
