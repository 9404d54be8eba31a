//! Reconciliation engine.
//!
//! Computes the removed/common/added partitions of one scope and one
//! resource kind and drives the policy callbacks over them. Passes on the
//! same scope are serialized by a scope lock; failures of individual
//! callbacks are tallied and never abort the rest of the batch.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ConflictError, Result};
use crate::provider::{ExternalObservation, ProviderRegistry};
use crate::state::{Entity, KeyedLocks, ResourceStore, ScopeRef, TaskStore};

use super::diff::{DiffResult, Partition, SyncTally};
use super::matcher::IdentityMatcher;
use super::policy::SyncPolicy;

/// Drives reconciliation passes.
pub struct ReconciliationEngine {
    store: Arc<dyn ResourceStore>,
    providers: ProviderRegistry,
    scope_locks: KeyedLocks<ScopeRef>,
    tasks: Option<Arc<dyn TaskStore>>,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    /// Creates an engine over a store and a set of provider adapters.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, providers: ProviderRegistry) -> Self {
        Self {
            store,
            providers,
            scope_locks: KeyedLocks::new(),
            tasks: None,
        }
    }

    /// Refuses passes over entities that an unfinished task still targets.
    #[must_use]
    pub fn with_task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Returns true while a pass holds the scope lock.
    #[must_use]
    pub fn is_reconciling(&self, scope: &ScopeRef) -> bool {
        self.scope_locks.is_locked(scope)
    }

    /// Fetches both sides for `scope` and reconciles them.
    ///
    /// The local side is read only after the scope lock is held, so a
    /// concurrent pass on the same scope always sees the entities created
    /// by the previous one.
    ///
    /// # Errors
    ///
    /// Returns `ConflictError::InTask` without touching anything when a
    /// local entity of the pass is the target of an unfinished task, and an
    /// error if the provider listing or the store read fails. Per-entity
    /// callback failures are reported in the tally instead.
    pub async fn reconcile(&self, scope: &ScopeRef, policy: &dyn SyncPolicy) -> Result<DiffResult> {
        let _guard = self.scope_locks.lock(scope).await;
        let kind = policy.kind();

        let local: Vec<Entity> = self
            .store
            .list_by_scope(scope)
            .await?
            .into_iter()
            .filter(|e| e.kind == kind && !e.is_default_placeholder())
            .collect();
        self.ensure_idle(&local).await?;

        let adapter = self.providers.get(scope.provider)?;
        let external: Vec<ExternalObservation> = adapter
            .list_remote(scope)
            .await?
            .into_iter()
            .filter(|o| o.kind == kind)
            .collect();

        debug!(
            scope = %scope,
            kind = %kind,
            local = local.len(),
            external = external.len(),
            "Reconciling"
        );

        Ok(Self::apply(scope, local, external, policy).await)
    }

    /// Fails if any of `local` is the target of an unfinished task.
    async fn ensure_idle(&self, local: &[Entity]) -> Result<()> {
        let Some(tasks) = &self.tasks else {
            return Ok(());
        };
        let unfinished = tasks.list_unfinished().await?;
        for entity in local {
            if let Some(task) = unfinished.iter().find(|t| t.target.id == entity.id) {
                warn!("Skipping sync: {} is in task {}", entity.short_desc(), task.id);
                return Err(ConflictError::InTask {
                    id: entity.id.clone(),
                    task_id: task.id.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Reconciles caller-supplied snapshots under the scope lock.
    pub async fn reconcile_sets(
        &self,
        scope: &ScopeRef,
        local: Vec<Entity>,
        external: Vec<ExternalObservation>,
        policy: &dyn SyncPolicy,
    ) -> DiffResult {
        let _guard = self.scope_locks.lock(scope).await;
        Self::apply(scope, local, external, policy).await
    }

    async fn apply(
        scope: &ScopeRef,
        local: Vec<Entity>,
        external: Vec<ExternalObservation>,
        policy: &dyn SyncPolicy,
    ) -> DiffResult {
        let outcome = IdentityMatcher::match_sets(scope, local, external);
        let mut tally = SyncTally::default();

        for entity in &outcome.local_only {
            let result = policy.on_removed(scope, entity).await;
            if let Err(e) = &result {
                warn!("Failed to remove {}: {e}", entity.short_desc());
            }
            tally.record(Partition::Removed, &entity.short_desc(), &result);
        }

        for (entity, observed) in &outcome.pairs {
            let result = policy.on_matched(scope, entity, observed).await;
            if let Err(e) = &result {
                warn!("Failed to sync {}: {e}", entity.short_desc());
            }
            tally.record(Partition::Common, &entity.short_desc(), &result);
        }

        for observed in &outcome.external_only {
            let result = policy.on_added(scope, observed).await;
            if let Err(e) = &result {
                warn!("Failed to record {}: {e}", observed.external_id);
            }
            tally.record(Partition::Added, &observed.external_id, &result);
        }

        let result = DiffResult {
            scope: scope.clone(),
            kind: policy.kind(),
            removed: outcome.local_only,
            common: outcome.pairs,
            added: outcome.external_only,
            tally,
        };
        info!("Sync {result}");
        result
    }
}
