//! Reconciliation of the local inventory against observed state.
//!
//! - [`IdentityMatcher`] pairs local entities with remote observations
//! - [`ReconciliationEngine`] drives a [`SyncPolicy`] over the partitions
//! - [`sweep`] converges a declarative row store by generation marking

mod diff;
mod engine;
mod matcher;
mod policy;
pub mod sweep;

pub use diff::{DiffResult, Partition, PartitionTally, SyncTally};
pub use engine::ReconciliationEngine;
pub use matcher::{IdentityMatcher, MatchOutcome};
pub use policy::{GLOBAL_REGION, SYNC_DELETE_REASON, StandardPolicy, SyncPolicy};
pub use sweep::{
    ConvergeReport, DeclarativeStore, DesiredRow, MemoryDeclarativeStore, Row, RowKind, converge,
};
