//! Reconciliation results.

use serde::Serialize;
use std::fmt;

use crate::provider::ExternalObservation;
use crate::state::{Entity, ResourceKind, ScopeRef};

/// The three partitions of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// Local-only entities.
    Removed,
    /// Matched pairs.
    Common,
    /// External-only observations.
    Added,
}

/// Success and failure counts of one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionTally {
    /// Callbacks that succeeded.
    pub ok: usize,
    /// Callbacks that failed.
    pub failed: usize,
}

/// Per-partition outcome counts, for observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncTally {
    /// Removed partition.
    pub removed: PartitionTally,
    /// Common partition.
    pub common: PartitionTally,
    /// Added partition.
    pub added: PartitionTally,
    /// Failure messages, prefixed with the subject.
    pub errors: Vec<String>,
}

impl SyncTally {
    /// Records one callback result.
    pub fn record<E: fmt::Display>(
        &mut self,
        partition: Partition,
        subject: &str,
        result: &Result<(), E>,
    ) {
        let tally = match partition {
            Partition::Removed => &mut self.removed,
            Partition::Common => &mut self.common,
            Partition::Added => &mut self.added,
        };
        match result {
            Ok(()) => tally.ok += 1,
            Err(e) => {
                tally.failed += 1;
                self.errors.push(format!("{subject}: {e}"));
            }
        }
    }

    /// Total failed callbacks.
    #[must_use]
    pub const fn failed(&self) -> usize {
        self.removed.failed + self.common.failed + self.added.failed
    }

    /// Returns true if no callback failed.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed() == 0
    }
}

impl fmt::Display for SyncTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "removed {}/{} common {}/{} added {}/{} (ok/failed)",
            self.removed.ok,
            self.removed.failed,
            self.common.ok,
            self.common.failed,
            self.added.ok,
            self.added.failed
        )
    }
}

/// Output of a reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    /// Reconciled scope.
    pub scope: ScopeRef,
    /// Reconciled kind.
    pub kind: ResourceKind,
    /// Local entities with no external counterpart.
    pub removed: Vec<Entity>,
    /// Paired local and external entities.
    pub common: Vec<(Entity, ExternalObservation)>,
    /// External entities with no local counterpart.
    pub added: Vec<ExternalObservation>,
    /// Outcome counts.
    pub tally: SyncTally,
}

impl DiffResult {
    /// Returns true if the pass found nothing to add or remove.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

impl fmt::Display for DiffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} removed, {} common, {} added; {}",
            self.scope,
            self.kind,
            self.removed.len(),
            self.common.len(),
            self.added.len(),
            self.tally
        )
    }
}
