//! Per-kind reconciliation policies.
//!
//! A [`SyncPolicy`] supplies the removed/matched/added callbacks driven by
//! the reconciliation engine. [`StandardPolicy`] implements the outcomes
//! shared by every synchronized resource kind.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::driver::ResourceDriver;
use crate::error::{ConflictError, ControlPlaneError, Result};
use crate::provider::ExternalObservation;
use crate::state::{Entity, EntityStatus, ResourceKind, ResourceStore, ScopeRef};
use crate::tasks::{CONTAINER_SYNC_TASK, TaskEngine, TaskTarget, UserContext};

/// Note attached to entities retired in place by sync.
pub const SYNC_DELETE_REASON: &str = "sync to delete";

/// Region used for cross-region group entities.
pub const GLOBAL_REGION: &str = "global";

/// Resource-kind-specific reconciliation callbacks.
#[async_trait]
pub trait SyncPolicy: Send + Sync {
    /// Kind reconciled by this policy.
    fn kind(&self) -> ResourceKind;

    /// Handles a local entity with no external counterpart.
    async fn on_removed(&self, scope: &ScopeRef, local: &Entity) -> Result<()>;

    /// Handles a matched pair.
    async fn on_matched(
        &self,
        scope: &ScopeRef,
        local: &Entity,
        external: &ExternalObservation,
    ) -> Result<()>;

    /// Handles an external observation with no local counterpart.
    async fn on_added(&self, scope: &ScopeRef, external: &ExternalObservation) -> Result<()>;
}

/// Standard removed/matched/added outcomes.
#[derive(Clone)]
pub struct StandardPolicy {
    kind: ResourceKind,
    store: Arc<dyn ResourceStore>,
    audit: AuditLog,
    driver: Arc<dyn ResourceDriver>,
    tasks: Option<TaskEngine>,
    actor: String,
}

impl std::fmt::Debug for StandardPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardPolicy")
            .field("kind", &self.kind)
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

/// Strips a region prefix (`region/`) from an external identifier.
fn region_independent_id<'a>(external_id: &'a str, region: &str) -> &'a str {
    external_id
        .strip_prefix(region)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(external_id)
}

/// Group name derived from a member name: everything before the first `(`.
fn group_name(member_name: &str) -> String {
    let base = member_name
        .split_once('(')
        .map_or(member_name, |(head, _)| head)
        .trim();
    if base.is_empty() {
        String::from("group")
    } else {
        base.to_string()
    }
}

impl StandardPolicy {
    /// Creates a policy for the driver's kind.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, audit: AuditLog, driver: Arc<dyn ResourceDriver>) -> Self {
        Self {
            kind: driver.kind(),
            store,
            audit,
            driver,
            tasks: None,
            actor: String::from("sync"),
        }
    }

    /// Attaches a task engine so container kinds cascade into child passes.
    #[must_use]
    pub fn with_tasks(mut self, tasks: TaskEngine) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Overrides the actor recorded in the change log.
    #[must_use]
    pub fn with_actor(mut self, actor: &str) -> Self {
        actor.clone_into(&mut self.actor);
        self
    }

    /// Picks `base`, `base-1`, `base-2`, ... whichever is free first.
    async fn unique_name(&self, scope: &ScopeRef, kind: ResourceKind, base: &str) -> Result<String> {
        if !self.store.name_taken(scope, kind, base).await? {
            return Ok(base.to_string());
        }
        let mut n = 1usize;
        loop {
            let candidate = format!("{base}-{n}");
            if !self.store.name_taken(scope, kind, &candidate).await? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Marks the direct dependents of a retired entity unknown.
    async fn mark_dependents_unknown(&self, entity: &Entity) -> Result<()> {
        let note = format!("{} {} removed remotely", entity.kind, entity.name);
        for dependent in self.store.dependents(&entity.id).await? {
            let (updated, changes) = self
                .store
                .update_with_diff(&dependent.id, &|e: &mut Entity| {
                    e.set_status(EntityStatus::Unknown, Some(note.as_str()));
                })
                .await?;
            if !changes.is_empty() {
                self.audit
                    .log_status(&updated, &changes, &note, &self.actor)
                    .await?;
            }
        }
        Ok(())
    }

    /// Attaches an entity to its cross-region group, creating the group if needed.
    async fn fold_into_group(&self, scope: &ScopeRef, entity: &Entity) -> Result<()> {
        if entity.group_id.is_some() || !self.driver.belongs_to_group() {
            return Ok(());
        }
        let Some(external_id) = entity.external_id.as_deref() else {
            return Ok(());
        };
        let suffix = region_independent_id(external_id, &scope.region);

        let sibling_group = self
            .store
            .list_all()
            .await?
            .into_iter()
            .filter(|e| {
                e.id != entity.id
                    && e.kind == entity.kind
                    && e.scope.provider == scope.provider
                    && e.scope.account == scope.account
            })
            .find_map(|e| {
                let ext = e.external_id.as_deref()?;
                let group = e.group_id.clone()?;
                (region_independent_id(ext, &e.scope.region) == suffix).then_some(group)
            });

        let group_id = match sibling_group {
            Some(id) => id,
            None => {
                let group_scope = ScopeRef::new(scope.provider, &scope.account, GLOBAL_REGION);
                let name = self
                    .unique_name(&group_scope, ResourceKind::Group, &group_name(&entity.name))
                    .await?;
                let mut group = Entity::new(ResourceKind::Group, group_scope, &name);
                group.status = EntityStatus::Available;
                let group = self.store.insert(group).await?;
                self.audit.log_create(&group, &self.actor).await?;
                info!("Created group {} for {}", group.short_desc(), entity.short_desc());
                group.id
            }
        };

        let (updated, changes) = self
            .store
            .update_with_diff(&entity.id, &|e: &mut Entity| {
                e.group_id = Some(group_id.clone());
            })
            .await?;
        self.audit
            .log_sync_update(&updated, &changes, &self.actor)
            .await?;
        Ok(())
    }

    /// Enqueues a child-kind pass for container entities.
    async fn cascade(&self, entity: &Entity) {
        let Some(tasks) = &self.tasks else {
            return;
        };
        if !self.driver.is_container() {
            return;
        }
        let scheduled = async {
            let handle = tasks
                .new_task(
                    CONTAINER_SYNC_TASK,
                    TaskTarget::of(entity),
                    None,
                    UserContext::new(&self.actor),
                )
                .await?;
            handle.schedule_run(serde_json::Value::Null).await?;
            Ok::<_, ControlPlaneError>(handle.id().to_string())
        };
        match scheduled.await {
            Ok(task_id) => debug!("Cascade task {task_id} queued for {}", entity.short_desc()),
            Err(e) => warn!("Failed to queue cascade for {}: {e}", entity.short_desc()),
        }
    }

    async fn resolve_parent(&self, scope: &ScopeRef, external: &ExternalObservation) -> Result<Option<String>> {
        let Some(parent_ext) = external.parent_external_id.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_by_external_id(scope, parent_ext)
            .await?
            .map(|p| p.id))
    }
}

#[async_trait]
impl SyncPolicy for StandardPolicy {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn on_removed(&self, scope: &ScopeRef, local: &Entity) -> Result<()> {
        if local.is_default_placeholder()
            || local.external_id.as_deref() == Some(scope.classic_network_external_id().as_str())
        {
            debug!("Keeping emulated entity {}", local.short_desc());
            return Ok(());
        }

        match self.store.delete(&local.id).await {
            Ok(deleted) => {
                self.audit
                    .log_delete(&deleted, SYNC_DELETE_REASON, &self.actor)
                    .await?;
                info!("Removed {} (gone remotely)", deleted.short_desc());
                Ok(())
            }
            Err(ControlPlaneError::Conflict(ConflictError::HasDependents { count, .. })) => {
                debug!(
                    "{} still has {count} dependent(s), retiring in place",
                    local.short_desc()
                );
                self.mark_dependents_unknown(local).await?;
                let (updated, changes) = self
                    .store
                    .update_with_diff(&local.id, &|e: &mut Entity| {
                        e.enabled = false;
                        e.set_status(EntityStatus::Unknown, Some(SYNC_DELETE_REASON));
                    })
                    .await?;
                if !changes.is_empty() {
                    self.audit
                        .log_disable(&updated, &changes, SYNC_DELETE_REASON, &self.actor)
                        .await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_matched(
        &self,
        scope: &ScopeRef,
        local: &Entity,
        external: &ExternalObservation,
    ) -> Result<()> {
        let parent_id = self.resolve_parent(scope, external).await?;
        let (updated, changes) = self
            .store
            .update_with_diff(&local.id, &|e: &mut Entity| {
                e.external_id = Some(external.external_id.clone());
                e.status = external.status;
                e.status_reason = None;
                e.size_gb = external.size_gb;
                e.storage_type.clone_from(&external.storage_type);
                e.tags.clone_from(&external.tags);
                e.is_default = external.is_default;
                e.is_emulated = external.is_emulated;
                e.metadata
                    .extend(external.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                if parent_id.is_some() {
                    e.parent_id.clone_from(&parent_id);
                }
            })
            .await?;

        if !changes.is_empty() {
            self.audit
                .log_sync_update(&updated, &changes, &self.actor)
                .await?;
        }

        if let Err(e) = self.fold_into_group(scope, &updated).await {
            warn!("{} group sync failed: {e}", updated.short_desc());
        }
        self.cascade(&updated).await;
        Ok(())
    }

    async fn on_added(&self, scope: &ScopeRef, external: &ExternalObservation) -> Result<()> {
        let base = if external.name.trim().is_empty() {
            external.external_id.as_str()
        } else {
            external.name.as_str()
        };
        let name = self.unique_name(scope, external.kind, base).await?;

        let mut entity = Entity::new(external.kind, scope.clone(), &name);
        entity.external_id = Some(external.external_id.clone());
        entity.status = external.status;
        entity.size_gb = external.size_gb;
        entity.storage_type.clone_from(&external.storage_type);
        entity.tags.clone_from(&external.tags);
        entity.metadata.clone_from(&external.metadata);
        entity.is_default = external.is_default;
        entity.is_emulated = external.is_emulated;
        entity.parent_id = self.resolve_parent(scope, external).await?;

        let entity = self.store.insert(entity).await?;
        self.audit.log_create(&entity, &self.actor).await?;
        info!("Recorded {} from {}", entity.short_desc(), external.external_id);

        if let Err(e) = self.fold_into_group(scope, &entity).await {
            warn!("{} group sync failed: {e}", entity.short_desc());
        }
        self.cascade(&entity).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_independent_id() {
        assert_eq!(
            region_independent_id("us-central1/net-1", "us-central1"),
            "net-1"
        );
        assert_eq!(region_independent_id("net-1", "us-central1"), "net-1");
        assert_eq!(
            region_independent_id("us-central1x/net-1", "us-central1"),
            "us-central1x/net-1"
        );
    }

    #[test]
    fn test_group_name_cuts_at_parenthesis() {
        assert_eq!(group_name("shared (us-east1)"), "shared");
        assert_eq!(group_name("plain"), "plain");
        assert_eq!(group_name("(anon)"), "group");
    }
}
