//! What a running stage can see and do.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::audit::AuditLog;
use crate::driver::{DriverRegistry, RemoteOperation, ResourceDriver};
use crate::error::Result;
use crate::provider::{ProviderAdapter, ProviderRegistry};
use crate::reconciler::ReconciliationEngine;
use crate::state::{Entity, ResourceStore, ScopeRef};

use super::engine::TaskEngine;
use super::types::{TaskRecord, TaskTarget, UserContext};

/// Collaborators available to stage handlers.
#[derive(Clone)]
pub struct TaskServices {
    /// Inventory.
    pub store: Arc<dyn ResourceStore>,
    /// Provider adapters.
    pub providers: ProviderRegistry,
    /// Driver lookup table.
    pub drivers: Arc<DriverRegistry>,
    /// Audit trail.
    pub audit: AuditLog,
    /// Reconciliation engine used by cascading procedures.
    pub reconciler: Arc<ReconciliationEngine>,
}

impl std::fmt::Debug for TaskServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskServices")
            .field("providers", &self.providers)
            .field("drivers", &self.drivers)
            .finish_non_exhaustive()
    }
}

/// How the running stage ends.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Transition {
    Stage(String),
    Complete(Value),
    Failed(String),
}

/// Work started once the stage's transition is persisted.
pub(crate) enum Launch {
    Remote {
        driver: Arc<dyn ResourceDriver>,
        adapter: Arc<dyn ProviderAdapter>,
        scope: ScopeRef,
        op: RemoteOperation,
    },
    Child {
        task_id: String,
    },
}

/// Handle passed to [`TaskProcedure::run_stage`](super::TaskProcedure::run_stage).
pub struct StageContext {
    engine: TaskEngine,
    record: TaskRecord,
    pub(crate) transition: Option<Transition>,
    pub(crate) launch: Option<Launch>,
    pub(crate) orphans: Vec<String>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("task", &self.record.id)
            .field("stage", &self.record.stage)
            .field("transition", &self.transition)
            .finish_non_exhaustive()
    }
}

impl StageContext {
    pub(crate) fn new(engine: TaskEngine, record: TaskRecord) -> Self {
        Self {
            engine,
            record,
            transition: None,
            launch: None,
            orphans: Vec::new(),
        }
    }

    /// Task identifier.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.record.id
    }

    /// Task kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.record.kind
    }

    /// Stage being run.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.record.stage
    }

    /// Target entity reference.
    #[must_use]
    pub const fn target(&self) -> &TaskTarget {
        &self.record.target
    }

    /// Parameters given when the task was scheduled.
    #[must_use]
    pub const fn params(&self) -> &Value {
        &self.record.params
    }

    /// Initiator.
    #[must_use]
    pub const fn user(&self) -> &UserContext {
        &self.record.user
    }

    /// Collaborators.
    #[must_use]
    pub fn services(&self) -> &TaskServices {
        self.engine.services()
    }

    /// The engine running this task.
    #[must_use]
    pub const fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Loads the target entity.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the entity was deleted under the task.
    pub async fn target_entity(&self) -> Result<Entity> {
        self.services().store.fetch(&self.record.target.id).await
    }

    /// Driver for the target entity.
    ///
    /// # Errors
    ///
    /// Returns an error if no driver serves the entity's pair.
    pub fn driver_for(&self, entity: &Entity) -> Result<Arc<dyn ResourceDriver>> {
        self.services().drivers.get(entity.scope.provider, entity.kind)
    }

    /// Names the stage that receives the next continuation.
    ///
    /// Ignored once a terminal outcome was declared in this stage.
    pub fn set_stage(&mut self, stage: &str) {
        if matches!(
            self.transition,
            Some(Transition::Complete(_) | Transition::Failed(_))
        ) {
            warn!(task = %self.record.id, stage, "set_stage after terminal outcome ignored");
            return;
        }
        self.transition = Some(Transition::Stage(stage.to_string()));
    }

    /// Declares terminal success.
    pub fn set_stage_complete(&mut self, result: Value) {
        if matches!(self.transition, Some(Transition::Failed(_))) {
            return;
        }
        self.transition = Some(Transition::Complete(result));
    }

    /// Declares terminal failure.
    pub fn set_stage_failed(&mut self, reason: impl Into<String>) {
        self.transition = Some(Transition::Failed(reason.into()));
    }

    /// Starts a remote operation whose outcome resumes the next stage.
    ///
    /// The operation starts only after this stage returns and its
    /// transition is persisted, and carries the engine's remote deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter serves the scope's provider.
    pub fn dispatch_remote(
        &mut self,
        driver: Arc<dyn ResourceDriver>,
        scope: ScopeRef,
        op: RemoteOperation,
    ) -> Result<()> {
        let adapter = self.services().providers.get(scope.provider)?;
        self.replace_launch(Launch::Remote {
            driver,
            adapter,
            scope,
            op,
        });
        Ok(())
    }

    /// Creates a child task whose terminal outcome resumes the next stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the child kind is unknown or cannot be persisted.
    pub async fn spawn_child(&mut self, kind: &str, target: TaskTarget, params: Value) -> Result<String> {
        let child = self
            .engine
            .create_record(kind, target, Some(&self.record.id), self.record.user.clone(), params)
            .await?;
        self.replace_launch(Launch::Child {
            task_id: child.id.clone(),
        });
        Ok(child.id)
    }

    fn replace_launch(&mut self, launch: Launch) {
        match self.launch.replace(launch) {
            Some(Launch::Child { task_id }) => {
                warn!(task = %self.record.id, child = %task_id, "Child replaced before launch");
                self.orphans.push(task_id);
            }
            Some(Launch::Remote { op, .. }) => {
                warn!(task = %self.record.id, op = %op.describe(), "Remote operation replaced before launch");
            }
            None => {}
        }
    }
}
