//! Built-in task procedures.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use crate::driver::RemoteOperation;
use crate::error::{ConflictError, ControlPlaneError, Result};
use crate::provider::{CreateSpec, ExternalObservation};
use crate::reconciler::StandardPolicy;
use crate::state::{Entity, EntityStatus};

use super::context::StageContext;
use super::procedure::{StageInput, TaskProcedure, TaskRegistry};
use super::types::TaskTarget;

/// Kind of [`EntityCreateTask`].
pub const CREATE_TASK: &str = "EntityCreateTask";
/// Kind of [`EntityDeleteTask`].
pub const DELETE_TASK: &str = "EntityDeleteTask";
/// Kind of [`EntitySyncStatusTask`].
pub const SYNC_STATUS_TASK: &str = "EntitySyncStatusTask";
/// Kind of [`ContainerSyncTask`].
pub const CONTAINER_SYNC_TASK: &str = "ContainerSyncTask";

impl TaskRegistry {
    /// A registry holding every built-in procedure.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EntityCreateTask));
        registry.register(Arc::new(EntityDeleteTask));
        registry.register(Arc::new(EntitySyncStatusTask));
        registry.register(Arc::new(ContainerSyncTask));
        registry
    }
}

/// Sets the target's status and records the change.
async fn set_entity_status(
    ctx: &StageContext,
    entity: &Entity,
    status: EntityStatus,
    note: &str,
) -> Result<Entity> {
    let services = ctx.services();
    let (updated, changes) = services
        .store
        .update_with_diff(&entity.id, &|e: &mut Entity| e.set_status(status, None))
        .await?;
    if !changes.is_empty() {
        services
            .audit
            .log_status(&updated, &changes, note, &ctx.user().user)
            .await?;
    }
    Ok(updated)
}

/// Removes the target locally after its remote object is gone.
async fn forget_entity(ctx: &StageContext, entity: &Entity) -> Result<()> {
    let services = ctx.services();
    let deleted = services.store.delete(&entity.id).await?;
    services
        .audit
        .log_delete(&deleted, "deleted by request", &ctx.user().user)
        .await?;
    info!("Deleted {}", deleted.short_desc());
    Ok(())
}

/// Creates the target's remote object from the [`CreateSpec`] parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntityCreateTask;

#[async_trait]
impl TaskProcedure for EntityCreateTask {
    fn kind(&self) -> &'static str {
        CREATE_TASK
    }

    fn stages(&self) -> &'static [&'static str] {
        &["on_init", "on_created"]
    }

    async fn run_stage(&self, stage: &str, ctx: &mut StageContext, input: StageInput) -> Result<()> {
        if stage == "on_init" {
            let spec: CreateSpec = serde_json::from_value(ctx.params().clone())
                .map_err(|e| ControlPlaneError::internal(format!("Invalid create parameters: {e}")))?;
            let entity = ctx.target_entity().await?;
            let driver = ctx.driver_for(&entity)?;
            driver.validate_create(&spec)?;
            let entity = set_entity_status(ctx, &entity, EntityStatus::Creating, "create requested").await?;

            ctx.set_stage("on_created");
            ctx.dispatch_remote(driver, entity.scope, RemoteOperation::Create(spec))?;
            return Ok(());
        }

        match input {
            StageInput::Completed(data) => {
                let Some(external_id) = data.get("external_id").and_then(Value::as_str) else {
                    ctx.set_stage_failed("Create returned no external id");
                    return Ok(());
                };
                let services = ctx.services();
                let (updated, changes) = services
                    .store
                    .update_with_diff(&ctx.target().id, &|e: &mut Entity| {
                        e.external_id = Some(external_id.to_string());
                        e.set_status(EntityStatus::Available, None);
                    })
                    .await?;
                services
                    .audit
                    .log_status(&updated, &changes, "created", &ctx.user().user)
                    .await?;
                info!("Created {} as {external_id}", updated.short_desc());
                ctx.set_stage_complete(json!({ "external_id": external_id }));
            }
            StageInput::Failed(reason) => ctx.set_stage_failed(reason),
            StageInput::Start(_) => ctx.set_stage_failed("Create restarted out of order"),
        }
        Ok(())
    }
}

/// Deletes the target remotely, then locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntityDeleteTask;

#[async_trait]
impl TaskProcedure for EntityDeleteTask {
    fn kind(&self) -> &'static str {
        DELETE_TASK
    }

    fn stages(&self) -> &'static [&'static str] {
        &["on_init", "on_deleted"]
    }

    async fn run_stage(&self, stage: &str, ctx: &mut StageContext, input: StageInput) -> Result<()> {
        if stage == "on_init" {
            let entity = ctx.target_entity().await?;
            if entity.is_default_placeholder() {
                return Err(ConflictError::ProtectedDefault { id: entity.id }.into());
            }
            let Some(external_id) = entity.external_id.clone() else {
                debug!("{} was never created remotely", entity.short_desc());
                forget_entity(ctx, &entity).await?;
                ctx.set_stage_complete(Value::Null);
                return Ok(());
            };
            let driver = ctx.driver_for(&entity)?;
            let entity = set_entity_status(ctx, &entity, EntityStatus::Deleting, "delete requested").await?;

            ctx.set_stage("on_deleted");
            ctx.dispatch_remote(driver, entity.scope, RemoteOperation::Delete { external_id })?;
            return Ok(());
        }

        match input {
            StageInput::Completed(_) => {
                let entity = ctx.target_entity().await?;
                forget_entity(ctx, &entity).await?;
                ctx.set_stage_complete(Value::Null);
            }
            StageInput::Failed(reason) => ctx.set_stage_failed(reason),
            StageInput::Start(_) => ctx.set_stage_failed("Delete restarted out of order"),
        }
        Ok(())
    }
}

/// Refreshes the target's status from its remote object.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntitySyncStatusTask;

#[async_trait]
impl TaskProcedure for EntitySyncStatusTask {
    fn kind(&self) -> &'static str {
        SYNC_STATUS_TASK
    }

    fn stages(&self) -> &'static [&'static str] {
        &["on_init", "on_sync_status_complete"]
    }

    async fn run_stage(&self, stage: &str, ctx: &mut StageContext, input: StageInput) -> Result<()> {
        if stage == "on_init" {
            let entity = ctx.target_entity().await?;
            let Some(external_id) = entity.external_id.clone() else {
                ctx.set_stage_failed(format!(
                    "Failed to find remote object for {}",
                    entity.short_desc()
                ));
                return Ok(());
            };
            let driver = ctx.driver_for(&entity)?;
            ctx.set_stage("on_sync_status_complete");
            ctx.dispatch_remote(driver, entity.scope, RemoteOperation::Refresh { external_id })?;
            return Ok(());
        }

        match input {
            StageInput::Completed(data) => {
                let observed: ExternalObservation = serde_json::from_value(data)
                    .map_err(|e| ControlPlaneError::internal(format!("Invalid refresh result: {e}")))?;
                let entity = ctx.target_entity().await?;
                let updated = set_entity_status(ctx, &entity, observed.status, "status synced").await?;
                ctx.set_stage_complete(json!({ "status": updated.status }));
            }
            StageInput::Failed(reason) => ctx.set_stage_failed(reason),
            StageInput::Start(_) => ctx.set_stage_failed("Sync status restarted out of order"),
        }
        Ok(())
    }
}

/// Syncs a container's status, then reconciles its child kinds.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContainerSyncTask;

#[async_trait]
impl TaskProcedure for ContainerSyncTask {
    fn kind(&self) -> &'static str {
        CONTAINER_SYNC_TASK
    }

    fn stages(&self) -> &'static [&'static str] {
        &["on_init", "on_status_synced"]
    }

    async fn run_stage(&self, stage: &str, ctx: &mut StageContext, input: StageInput) -> Result<()> {
        if stage == "on_init" {
            let entity = ctx.target_entity().await?;
            ctx.spawn_child(SYNC_STATUS_TASK, TaskTarget::of(&entity), Value::Null)
                .await?;
            ctx.set_stage("on_status_synced");
            return Ok(());
        }

        match input {
            StageInput::Completed(_) => {
                let entity = ctx.target_entity().await?;
                let driver = ctx.driver_for(&entity)?;
                let services = ctx.services().clone();

                let mut passes = Vec::new();
                for &child_kind in driver.child_kinds() {
                    let child_driver = services.drivers.get(entity.scope.provider, child_kind)?;
                    let policy = StandardPolicy::new(
                        Arc::clone(&services.store),
                        services.audit.clone(),
                        child_driver,
                    )
                    .with_tasks(ctx.engine().clone())
                    .with_actor(&ctx.user().user);
                    let result = services.reconciler.reconcile(&entity.scope, &policy).await?;
                    passes.push(json!({
                        "kind": child_kind,
                        "removed": result.removed.len(),
                        "common": result.common.len(),
                        "added": result.added.len(),
                        "failed": result.tally.failed(),
                    }));
                }
                ctx.set_stage_complete(json!({ "passes": passes }));
            }
            StageInput::Failed(reason) => {
                ctx.set_stage_failed(format!("{SYNC_STATUS_TASK} failed: {reason}"));
            }
            StageInput::Start(_) => ctx.set_stage_failed("Container sync restarted out of order"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderOp;
    use crate::state::{LogAction, ResourceKind, ResourceStore};
    use crate::tasks::fixtures::{Fixture, WAIT};
    use crate::tasks::{TaskOutcome, UserContext};

    fn disk_spec(name: &str) -> Value {
        json!({
            "kind": "disk",
            "name": name,
            "size_gb": 100,
            "storage_type": "gp2",
        })
    }

    async fn pending_disk(f: &Fixture, name: &str) -> Entity {
        f.store
            .insert(Entity::new(ResourceKind::Disk, f.scope.clone(), name))
            .await
            .expect("insert")
    }

    #[tokio::test]
    async fn test_create_failure_reason_is_verbatim() {
        let f = Fixture::builtin().await;
        f.provider.fail(ProviderOp::Create, "quota exceeded");
        let disk = pending_disk(&f, "data").await;

        let handle = f
            .engine
            .new_task(CREATE_TASK, TaskTarget::of(&disk), None, UserContext::new("alice"))
            .await
            .expect("task");
        handle.schedule_run(disk_spec("data")).await.expect("schedule");

        let record = handle.wait(WAIT).await.expect("terminal");
        assert_eq!(record.outcome, TaskOutcome::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("quota exceeded"));
        assert_eq!(record.stage_names(), vec!["on_init", "on_created"]);

        let entity = f.store.fetch(&disk.id).await.expect("entity");
        assert_eq!(entity.status, EntityStatus::Unknown);
        assert_eq!(entity.status_reason.as_deref(), Some("quota exceeded"));

        let log = f.store.change_log(Some(&disk.id)).await.expect("log");
        let failure = log
            .iter()
            .find(|e| e.action == LogAction::TaskFailed)
            .expect("failure audited");
        assert_eq!(failure.note.as_deref(), Some("EntityCreateTask: quota exceeded"));
        assert_eq!(failure.actor, "alice");
    }

    #[tokio::test]
    async fn test_create_binds_external_id() {
        let f = Fixture::builtin().await;
        let disk = pending_disk(&f, "data").await;

        let handle = f
            .engine
            .new_task(CREATE_TASK, TaskTarget::of(&disk), None, UserContext::system())
            .await
            .expect("task");
        handle.schedule_run(disk_spec("data")).await.expect("schedule");
        let record = handle.wait(WAIT).await.expect("terminal");
        assert_eq!(record.outcome, TaskOutcome::Succeeded);

        let entity = f.store.fetch(&disk.id).await.expect("entity");
        assert_eq!(entity.status, EntityStatus::Available);
        let external_id = entity.external_id.expect("bound");
        assert_eq!(record.result, Some(json!({ "external_id": external_id })));
        assert!(f
            .provider
            .objects(&f.scope)
            .iter()
            .any(|o| o.external_id == external_id && o.size_gb == Some(100)));
    }

    #[tokio::test]
    async fn test_delete_removes_remote_then_local() {
        let f = Fixture::builtin().await;
        let handle = f
            .engine
            .new_task(DELETE_TASK, f.target.clone(), None, UserContext::system())
            .await
            .expect("task");
        handle.schedule_run(Value::Null).await.expect("schedule");

        let record = handle.wait(WAIT).await.expect("terminal");
        assert_eq!(record.outcome, TaskOutcome::Succeeded);
        assert!(f.store.get(&f.target.id).await.expect("get").is_none());
        assert!(f.provider.objects(&f.scope).is_empty());
        let log = f.store.change_log(Some(&f.target.id)).await.expect("log");
        assert_eq!(log.last().map(|e| e.action), Some(LogAction::Delete));
    }

    #[tokio::test]
    async fn test_delete_never_created_skips_remote() {
        let f = Fixture::builtin().await;
        let disk = pending_disk(&f, "draft").await;
        let handle = f
            .engine
            .new_task(DELETE_TASK, TaskTarget::of(&disk), None, UserContext::system())
            .await
            .expect("task");
        handle.schedule_run(Value::Null).await.expect("schedule");

        assert_eq!(handle.wait(WAIT).await.expect("terminal").outcome, TaskOutcome::Succeeded);
        assert_eq!(f.provider.calls(ProviderOp::Delete), 0);
        assert!(f.store.get(&disk.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_sync_status_mirrors_remote_status() {
        let f = Fixture::builtin().await;
        let mut observed = f.provider.objects(&f.scope)[0].clone();
        observed.status = EntityStatus::Unavailable;
        f.provider.put(&f.scope, observed);

        let handle = f
            .engine
            .new_task(SYNC_STATUS_TASK, f.target.clone(), None, UserContext::system())
            .await
            .expect("task");
        handle.schedule_run(Value::Null).await.expect("schedule");

        let record = handle.wait(WAIT).await.expect("terminal");
        assert_eq!(record.outcome, TaskOutcome::Succeeded);
        assert_eq!(
            f.store.fetch(&f.target.id).await.expect("entity").status,
            EntityStatus::Unavailable
        );
    }

    #[tokio::test]
    async fn test_container_sync_reconciles_children() {
        let f = Fixture::builtin().await;
        let mut network = Entity::new(ResourceKind::Network, f.scope.clone(), "vpc");
        network.external_id = Some(String::from("vpc-1"));
        network.status = EntityStatus::Available;
        let network = f.store.insert(network).await.expect("insert");
        f.provider.put(
            &f.scope,
            ExternalObservation::new(ResourceKind::Network, "vpc-1", "vpc"),
        );
        let mut subnet = ExternalObservation::new(ResourceKind::Subnet, "subnet-1", "private");
        subnet.parent_external_id = Some(String::from("vpc-1"));
        f.provider.put(&f.scope, subnet);

        let handle = f
            .engine
            .new_task(CONTAINER_SYNC_TASK, TaskTarget::of(&network), None, UserContext::system())
            .await
            .expect("task");
        handle.schedule_run(Value::Null).await.expect("schedule");

        let record = handle.wait(WAIT).await.expect("terminal");
        assert_eq!(record.outcome, TaskOutcome::Succeeded, "{:?}", record.failure_reason);
        assert_eq!(record.result.as_ref().map(|r| r["passes"][0]["added"].clone()), Some(json!(1)));

        let child = f
            .store
            .find_by_external_id(&f.scope, "subnet-1")
            .await
            .expect("find")
            .expect("subnet recorded");
        assert_eq!(child.parent_id.as_deref(), Some(network.id.as_str()));

        let status_task = f
            .engine
            .list()
            .await
            .expect("list")
            .into_iter()
            .find(|t| t.kind == SYNC_STATUS_TASK)
            .expect("child task");
        assert_eq!(status_task.parent_id.as_deref(), Some(record.id.as_str()));
        assert_eq!(status_task.outcome, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_container_sync_reports_child_failure() {
        let f = Fixture::builtin().await;
        f.provider.fail(ProviderOp::Refresh, "region unreachable");
        let handle = f
            .engine
            .new_task(CONTAINER_SYNC_TASK, f.target.clone(), None, UserContext::system())
            .await
            .expect("task");
        handle.schedule_run(Value::Null).await.expect("schedule");

        let record = handle.wait(WAIT).await.expect("terminal");
        assert_eq!(
            record.failure_reason.as_deref(),
            Some("EntitySyncStatusTask failed: region unreachable")
        );
    }

    #[tokio::test]
    async fn test_delete_of_default_placeholder_leaves_it_untouched() {
        let f = Fixture::builtin().await;
        let placeholder = f.store.ensure_default_placeholder().await.expect("placeholder");

        let handle = f
            .engine
            .new_task(DELETE_TASK, TaskTarget::of(&placeholder), None, UserContext::system())
            .await
            .expect("task");
        handle.schedule_run(Value::Null).await.expect("schedule");

        let record = handle.wait(WAIT).await.expect("terminal");
        assert_eq!(record.outcome, TaskOutcome::Failed);
        assert!(record.failure_reason.expect("reason").contains("protected"));
        assert_eq!(f.store.fetch(&placeholder.id).await.expect("placeholder"), placeholder);
        assert_eq!(f.provider.calls(ProviderOp::Delete), 0);
    }
}
