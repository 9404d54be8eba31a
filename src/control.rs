//! Control plane facade.
//!
//! [`ControlPlane`] wires the store, the provider adapters, the driver
//! table, the reconciliation engine and the task engine together and exposes
//! the request-level operations. Requests that can be refused are checked
//! synchronously, before any entity or task exists.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::driver::DriverRegistry;
use crate::error::{ConflictError, ControlPlaneError, Result};
use crate::provider::{CreateSpec, ProviderRegistry};
use crate::reconciler::{DiffResult, ReconciliationEngine, StandardPolicy};
use crate::state::{Entity, MemoryStore, ResourceKind, ResourceStore, ScopeRef};
use crate::tasks::{
    CREATE_TASK, DELETE_TASK, EngineSettings, RecoveryReport, SYNC_STATUS_TASK, TaskEngine,
    TaskHandle, TaskRegistry, TaskServices, TaskTarget, UserContext, recover_stale,
};

/// A request to create one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRequest {
    /// Where to create it.
    pub scope: ScopeRef,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Requested name.
    pub name: String,
    /// Size in GB, for disks.
    #[serde(default)]
    pub size_gb: Option<u32>,
    /// Storage type, for disks.
    #[serde(default)]
    pub storage_type: Option<String>,
    /// Local id of the containing entity.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl CreateRequest {
    /// A request with no optional attributes.
    #[must_use]
    pub fn new(scope: ScopeRef, kind: ResourceKind, name: &str) -> Self {
        Self {
            scope,
            kind,
            name: name.to_string(),
            size_gb: None,
            storage_type: None,
            parent_id: None,
            tags: BTreeMap::new(),
        }
    }

    /// Sets the disk attributes.
    #[must_use]
    pub fn with_disk(mut self, storage_type: &str, size_gb: u32) -> Self {
        self.storage_type = Some(storage_type.to_string());
        self.size_gb = Some(size_gb);
        self
    }
}

/// Outcome of one pass of [`ControlPlane::sync_all`].
#[derive(Debug)]
pub struct SyncOutcome {
    /// Reconciled scope.
    pub scope: ScopeRef,
    /// Reconciled kind.
    pub kind: ResourceKind,
    /// The pass result; an error only affects its own scope.
    pub result: Result<DiffResult>,
}

/// The assembled control plane.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    store: Arc<MemoryStore>,
    providers: ProviderRegistry,
    drivers: Arc<DriverRegistry>,
    audit: AuditLog,
    reconciler: Arc<ReconciliationEngine>,
    tasks: TaskEngine,
    scopes: Vec<ScopeRef>,
    cascade: Vec<ResourceKind>,
}

impl ControlPlane {
    /// Assembles a control plane with the built-in procedures and makes sure
    /// the default placeholder exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the placeholder cannot be persisted.
    pub async fn new(
        store: Arc<MemoryStore>,
        providers: ProviderRegistry,
        drivers: DriverRegistry,
        settings: EngineSettings,
    ) -> Result<Self> {
        store.ensure_default_placeholder().await?;

        let drivers = Arc::new(drivers);
        let audit = AuditLog::new(store.clone());
        let reconciler = Arc::new(
            ReconciliationEngine::new(store.clone(), providers.clone()).with_task_store(store.clone()),
        );
        let services = TaskServices {
            store: store.clone(),
            providers: providers.clone(),
            drivers: drivers.clone(),
            audit: audit.clone(),
            reconciler: reconciler.clone(),
        };
        let tasks = TaskEngine::new(store.clone(), TaskRegistry::with_builtins(), services, settings);

        Ok(Self {
            store,
            providers,
            drivers,
            audit,
            reconciler,
            tasks,
            scopes: Vec::new(),
            cascade: vec![ResourceKind::Subnet],
        })
    }

    /// Sets the scopes covered by [`sync_all`](Self::sync_all).
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<ScopeRef>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Sets the child kinds a container pass may cascade into.
    ///
    /// Containers none of whose child kinds are listed are reconciled
    /// without a cascade task.
    #[must_use]
    pub fn with_cascade(mut self, kinds: Vec<ResourceKind>) -> Self {
        self.cascade = kinds;
        self
    }

    /// Configured scopes.
    #[must_use]
    pub fn scopes(&self) -> &[ScopeRef] {
        &self.scopes
    }

    /// The inventory.
    #[must_use]
    pub const fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// The task engine.
    #[must_use]
    pub const fn tasks(&self) -> &TaskEngine {
        &self.tasks
    }

    /// The provider adapters.
    #[must_use]
    pub const fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    fn policy(&self, scope: &ScopeRef, kind: ResourceKind) -> Result<StandardPolicy> {
        let driver = self.drivers.get(scope.provider, kind)?;
        let cascades = driver
            .child_kinds()
            .iter()
            .any(|child| self.cascade.contains(child));
        let policy = StandardPolicy::new(self.store.clone(), self.audit.clone(), driver);
        Ok(if cascades {
            policy.with_tasks(self.tasks.clone())
        } else {
            policy
        })
    }

    /// Reconciles one kind in one scope.
    ///
    /// # Errors
    ///
    /// Returns an error if no driver serves the pair, the listing fails, or
    /// an entity of the pass is the target of an unfinished task.
    pub async fn sync_scope(&self, scope: &ScopeRef, kind: ResourceKind) -> Result<DiffResult> {
        let policy = self.policy(scope, kind)?;
        self.reconciler.reconcile(scope, &policy).await
    }

    /// Reconciles `kinds`, in order, in every configured scope.
    ///
    /// Scopes run concurrently; a failing scope does not stop the others.
    pub async fn sync_all(&self, kinds: &[ResourceKind]) -> Vec<SyncOutcome> {
        let mut passes = JoinSet::new();
        for scope in &self.scopes {
            let plane = self.clone();
            let scope = scope.clone();
            let kinds = kinds.to_vec();
            passes.spawn(async move {
                let mut outcomes = Vec::with_capacity(kinds.len());
                for kind in kinds {
                    let result = plane.sync_scope(&scope, kind).await;
                    if let Err(e) = &result {
                        warn!("Sync of {kind} in {scope} failed: {e}");
                    }
                    outcomes.push(SyncOutcome {
                        scope: scope.clone(),
                        kind,
                        result,
                    });
                }
                outcomes
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = passes.join_next().await {
            match joined {
                Ok(scope_outcomes) => outcomes.extend(scope_outcomes),
                Err(e) => warn!("Sync pass aborted: {e}"),
            }
        }
        outcomes.sort_by(|a, b| a.scope.cmp(&b.scope));
        outcomes
    }

    /// Records a new entity and starts its create task.
    ///
    /// The driver validates the request before anything is recorded.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad request or a taken name, a
    /// not-found error for an unknown parent, or a store error.
    pub async fn request_create(&self, request: CreateRequest, user: UserContext) -> Result<(Entity, TaskHandle)> {
        let driver = self.drivers.get(request.scope.provider, request.kind)?;
        let parent = match &request.parent_id {
            Some(parent_id) => Some(self.store.fetch(parent_id).await?),
            None => None,
        };
        let spec = CreateSpec {
            kind: request.kind,
            name: request.name.clone(),
            size_gb: request.size_gb,
            storage_type: request.storage_type.clone(),
            parent_external_id: parent.as_ref().and_then(|p| p.external_id.clone()),
            tags: request.tags.clone(),
        };
        driver.validate_create(&spec)?;
        if self
            .store
            .name_taken(&request.scope, request.kind, &request.name)
            .await?
        {
            return Err(ControlPlaneError::validation(
                format!("{} name {} is already in use", request.kind, request.name),
                "name",
            ));
        }

        let mut entity = Entity::new(request.kind, request.scope.clone(), &request.name);
        entity.size_gb = request.size_gb;
        entity.storage_type = request.storage_type;
        entity.tags = request.tags;
        entity.parent_id = parent.map(|p| p.id);
        let entity = self.store.insert(entity).await?;
        self.audit.log_create(&entity, &user.user).await?;

        let handle = self
            .tasks
            .new_task(CREATE_TASK, TaskTarget::of(&entity), None, user)
            .await?;
        let params = serde_json::to_value(&spec)
            .map_err(|e| ControlPlaneError::internal(format!("Failed to encode create spec: {e}")))?;
        handle.schedule_run(params).await?;
        info!("Create of {} requested as task {}", entity.short_desc(), handle.id());
        Ok((entity, handle))
    }

    /// Starts the delete task of an entity.
    ///
    /// # Errors
    ///
    /// Returns a conflict, with nothing mutated, if the entity is the
    /// default placeholder, still has dependents, or is busy with another
    /// task.
    pub async fn request_delete(&self, id: &str, user: UserContext) -> Result<TaskHandle> {
        let entity = self.store.fetch(id).await?;
        if entity.is_default_placeholder() {
            return Err(ConflictError::ProtectedDefault { id: entity.id }.into());
        }
        let count = self.store.count_dependents(id).await?;
        if count > 0 {
            return Err(ConflictError::HasDependents {
                kind: entity.kind.to_string(),
                id: entity.id,
                count,
            }
            .into());
        }
        self.ensure_idle(&entity).await?;

        let handle = self
            .tasks
            .new_task(DELETE_TASK, TaskTarget::of(&entity), None, user)
            .await?;
        handle.schedule_run(Value::Null).await?;
        info!("Delete of {} requested as task {}", entity.short_desc(), handle.id());
        Ok(handle)
    }

    /// Starts a status refresh of an entity.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the entity is busy with another task.
    pub async fn request_sync_status(&self, id: &str, user: UserContext) -> Result<TaskHandle> {
        let entity = self.store.fetch(id).await?;
        self.ensure_idle(&entity).await?;
        let handle = self
            .tasks
            .new_task(SYNC_STATUS_TASK, TaskTarget::of(&entity), None, user)
            .await?;
        handle.schedule_run(Value::Null).await?;
        debug!("Status sync of {} requested as task {}", entity.short_desc(), handle.id());
        Ok(handle)
    }

    async fn ensure_idle(&self, entity: &Entity) -> Result<()> {
        match self.tasks.active_task_for(&entity.id).await? {
            Some(task) => Err(ConflictError::InTask {
                id: entity.id.clone(),
                task_id: task.id,
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Re-drives or fails tasks left behind by a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the task store fails.
    pub async fn recover_stale(&self) -> Result<RecoveryReport> {
        recover_stale(&self.tasks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ExternalObservation, InMemoryProvider, ProviderOp};
    use crate::state::{DEFAULT_ENTITY_ID, EntityStatus, ProviderKind};
    use crate::tasks::{CONTAINER_SYNC_TASK, TaskOutcome};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        plane: ControlPlane,
        provider: Arc<InMemoryProvider>,
        scope: ScopeRef,
    }

    async fn harness() -> Harness {
        let provider = Arc::new(InMemoryProvider::new());
        let mut providers = ProviderRegistry::new();
        providers.register(ProviderKind::Aws, provider.clone());
        let scope = ScopeRef::new(ProviderKind::Aws, "acct", "us-east-1");
        let plane = ControlPlane::new(
            Arc::new(MemoryStore::new()),
            providers,
            DriverRegistry::with_defaults(),
            EngineSettings::default(),
        )
        .await
        .expect("control plane")
        .with_scopes(vec![scope.clone()]);
        Harness {
            plane,
            provider,
            scope,
        }
    }

    async fn bound(h: &Harness, kind: ResourceKind, name: &str, external_id: &str) -> Entity {
        let mut entity = Entity::new(kind, h.scope.clone(), name);
        entity.external_id = Some(external_id.to_string());
        entity.status = EntityStatus::Available;
        h.plane.store().insert(entity).await.expect("insert")
    }

    #[tokio::test]
    async fn test_delete_with_dependents_is_refused_without_mutation() {
        let h = harness().await;
        let network = bound(&h, ResourceKind::Network, "vpc", "vpc-1").await;
        let mut subnet = Entity::new(ResourceKind::Subnet, h.scope.clone(), "private");
        subnet.parent_id = Some(network.id.clone());
        let subnet = h.plane.store().insert(subnet).await.expect("insert");

        let err = h
            .plane
            .request_delete(&network.id, UserContext::new("bob"))
            .await
            .expect_err("refused");
        assert!(matches!(
            err,
            ControlPlaneError::Conflict(ConflictError::HasDependents { count: 1, .. })
        ));

        assert_eq!(h.plane.store().fetch(&network.id).await.expect("network"), network);
        assert_eq!(h.plane.store().fetch(&subnet.id).await.expect("subnet"), subnet);
        assert!(h.plane.tasks().list().await.expect("tasks").is_empty());
        assert_eq!(h.provider.calls(ProviderOp::Delete), 0);
    }

    #[tokio::test]
    async fn test_default_placeholder_is_protected() {
        let h = harness().await;
        let err = h
            .plane
            .request_delete(DEFAULT_ENTITY_ID, UserContext::system())
            .await
            .expect_err("refused");
        assert!(matches!(
            err,
            ControlPlaneError::Conflict(ConflictError::ProtectedDefault { .. })
        ));
        assert!(h.plane.store().get(DEFAULT_ENTITY_ID).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_invalid_create_leaves_no_trace() {
        let h = harness().await;
        let request = CreateRequest::new(h.scope.clone(), ResourceKind::Disk, "data").with_disk("st1", 100);

        let err = h
            .plane
            .request_create(request, UserContext::system())
            .await
            .expect_err("rejected");
        assert!(matches!(err, ControlPlaneError::Validation { .. }), "{err}");
        assert!(h.plane.store().list_by_scope(&h.scope).await.expect("list").is_empty());
        assert!(h.plane.tasks().list().await.expect("tasks").is_empty());
        assert_eq!(h.provider.calls(ProviderOp::Create), 0);
    }

    #[tokio::test]
    async fn test_create_then_delete() {
        let h = harness().await;
        let request = CreateRequest::new(h.scope.clone(), ResourceKind::Disk, "data").with_disk("gp2", 20);
        let (entity, handle) = h
            .plane
            .request_create(request.clone(), UserContext::new("alice"))
            .await
            .expect("accepted");
        assert_eq!(handle.wait(WAIT).await.expect("created").outcome, TaskOutcome::Succeeded);
        assert_eq!(h.provider.objects(&h.scope).len(), 1);

        let taken = h
            .plane
            .request_create(request, UserContext::new("alice"))
            .await
            .expect_err("name taken");
        assert!(matches!(taken, ControlPlaneError::Validation { .. }));

        let handle = h
            .plane
            .request_delete(&entity.id, UserContext::new("alice"))
            .await
            .expect("accepted");
        assert_eq!(handle.wait(WAIT).await.expect("deleted").outcome, TaskOutcome::Succeeded);
        assert!(h.provider.objects(&h.scope).is_empty());
        assert!(h.plane.store().get(&entity.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_busy_entity_is_refused() {
        let h = harness().await;
        let vm = bound(&h, ResourceKind::Vm, "web", "i-1").await;
        h.provider.put(&h.scope, ExternalObservation::new(ResourceKind::Vm, "i-1", "web"));
        h.provider.delay(ProviderOp::Refresh, Duration::from_millis(500));

        let first = h
            .plane
            .request_sync_status(&vm.id, UserContext::system())
            .await
            .expect("accepted");
        let err = h
            .plane
            .request_delete(&vm.id, UserContext::system())
            .await
            .expect_err("busy");
        match err {
            ControlPlaneError::Conflict(ConflictError::InTask { task_id, .. }) => {
                assert_eq!(task_id, first.id());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(first.wait(WAIT).await.expect("synced").outcome, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_sync_all_cascades_into_subnets() {
        let h = harness().await;
        h.provider.put(
            &h.scope,
            ExternalObservation::new(ResourceKind::Network, "vpc-1", "main"),
        );
        let mut subnet = ExternalObservation::new(ResourceKind::Subnet, "subnet-1", "private");
        subnet.parent_external_id = Some(String::from("vpc-1"));
        h.provider.put(&h.scope, subnet);

        let outcomes = h.plane.sync_all(&[ResourceKind::Network]).await;
        assert_eq!(outcomes.len(), 1);
        let result = outcomes[0].result.as_ref().expect("pass");
        assert_eq!(result.added.len(), 1);

        let cascade = h
            .plane
            .tasks()
            .list()
            .await
            .expect("tasks")
            .into_iter()
            .find(|t| t.kind == CONTAINER_SYNC_TASK)
            .expect("cascade enqueued");
        let record = h.plane.tasks().wait_terminal(&cascade.id, WAIT).await.expect("cascade");
        assert_eq!(record.outcome, TaskOutcome::Succeeded, "{:?}", record.failure_reason);

        let network = h
            .plane
            .store()
            .find_by_external_id(&h.scope, "vpc-1")
            .await
            .expect("find")
            .expect("network");
        let subnet = h
            .plane
            .store()
            .find_by_external_id(&h.scope, "subnet-1")
            .await
            .expect("find")
            .expect("subnet");
        assert_eq!(subnet.parent_id, Some(network.id));
    }

    #[tokio::test]
    async fn test_empty_cascade_skips_container_tasks() {
        let h = harness().await;
        let plane = h.plane.clone().with_cascade(Vec::new());
        h.provider.put(
            &h.scope,
            ExternalObservation::new(ResourceKind::Network, "vpc-1", "main"),
        );

        let result = plane.sync_scope(&h.scope, ResourceKind::Network).await.expect("pass");
        assert_eq!(result.added.len(), 1);
        assert!(plane.tasks().list().await.expect("tasks").is_empty());
    }

    #[tokio::test]
    async fn test_sync_all_isolates_failing_scope() {
        let h = harness().await;
        let other = ScopeRef::new(ProviderKind::Gcp, "proj", "us-central1");
        let plane = h.plane.clone().with_scopes(vec![h.scope.clone(), other.clone()]);
        h.provider.put(&h.scope, ExternalObservation::new(ResourceKind::Vm, "i-1", "web"));

        let outcomes = plane.sync_all(&[ResourceKind::Vm]).await;
        assert_eq!(outcomes.len(), 2);
        let aws = outcomes.iter().find(|o| o.scope == h.scope).expect("aws");
        assert_eq!(aws.result.as_ref().expect("aws pass").added.len(), 1);
        let gcp = outcomes.iter().find(|o| o.scope == other).expect("gcp");
        assert!(gcp.result.is_err(), "no adapter registered for gcp");
    }

    #[tokio::test]
    async fn test_sync_waits_for_in_flight_create() {
        let h = harness().await;
        h.provider.delay(ProviderOp::Create, Duration::from_millis(300));
        let request = CreateRequest::new(h.scope.clone(), ResourceKind::Disk, "data").with_disk("gp2", 20);
        let (entity, handle) = h
            .plane
            .request_create(request, UserContext::new("alice"))
            .await
            .expect("accepted");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = h
            .plane
            .sync_scope(&h.scope, ResourceKind::Disk)
            .await
            .expect_err("entity in task");
        assert!(matches!(
            err,
            ControlPlaneError::Conflict(ConflictError::InTask { ref id, .. }) if *id == entity.id
        ));
        assert!(h.plane.store().get(&entity.id).await.expect("get").is_some());

        let record = handle.wait(WAIT).await.expect("created");
        assert_eq!(record.outcome, TaskOutcome::Succeeded, "{:?}", record.failure_reason);
        assert_eq!(h.provider.objects(&h.scope).len(), 1);

        let result = h.plane.sync_scope(&h.scope, ResourceKind::Disk).await.expect("pass");
        assert!(result.removed.is_empty());
        assert!(result.added.is_empty());
        assert_eq!(result.common.len(), 1);
    }
}
