//! Task engine.
//!
//! Drives [`TaskRecord`]s through the stages declared by their
//! [`TaskProcedure`]. A stage runs on a worker permit and under the task's
//! exclusive lock; it ends by naming the next stage (and optionally
//! starting a remote operation or child task whose outcome resumes it) or
//! by declaring a terminal outcome. Continuations carry a one-shot token so
//! duplicate or stale deliveries are ignored.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::driver::{RemoteOperation, ResourceDriver};
use crate::error::{ControlPlaneError, ProviderError, Result, StoreError, TaskError};
use crate::provider::ProviderAdapter;
use crate::state::{DEFAULT_ENTITY_ID, Entity, EntityStatus, KeyedLocks, ScopeRef, TaskStore};

use super::context::{Launch, StageContext, TaskServices, Transition};
use super::procedure::{StageInput, TaskRegistry};
use super::types::{AwaitKind, Awaiting, TaskOutcome, TaskRecord, TaskTarget, UserContext};

/// Default number of concurrently running stages.
pub const DEFAULT_WORKERS: usize = 8;

/// Default absolute deadline of a remote operation, in seconds.
pub const DEFAULT_REMOTE_DEADLINE_SECS: u64 = 300;

/// Default idle time after which an unfinished task counts as stale, in seconds.
pub const DEFAULT_STALE_TASK_SECS: u64 = 900;

/// Tunables of a [`TaskEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Worker pool size.
    pub workers: usize,
    /// Deadline of each remote operation.
    pub remote_deadline: Duration,
    /// Idle time after which an unfinished task is recovered.
    pub stale_after: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            remote_deadline: Duration::from_secs(DEFAULT_REMOTE_DEADLINE_SECS),
            stale_after: Duration::from_secs(DEFAULT_STALE_TASK_SECS),
        }
    }
}

/// Work that runs after the task lock is released.
enum PostAction {
    Launch {
        task_id: String,
        token: String,
        launch: Launch,
    },
    NotifyParent(TaskRecord),
    Abandon {
        task_ids: Vec<String>,
        reason: String,
    },
}

struct Inner {
    store: Arc<dyn TaskStore>,
    registry: TaskRegistry,
    services: TaskServices,
    settings: EngineSettings,
    workers: Arc<Semaphore>,
    task_locks: KeyedLocks<String>,
    changed: watch::Sender<u64>,
}

/// Executes task procedures. Cheap to clone.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("registry", &self.inner.registry)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

/// Reference to a created task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    engine: TaskEngine,
    id: String,
}

impl TaskHandle {
    /// Task identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts the task with `params`; later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be loaded or saved.
    pub async fn schedule_run(&self, params: Value) -> Result<()> {
        self.engine.start(&self.id, Some(params)).await.map(|_| ())
    }

    /// Waits for the task's terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::WaitTimeout` if the task is still running after `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<TaskRecord> {
        self.engine.wait_terminal(&self.id, timeout).await
    }
}

impl TaskEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: TaskRegistry,
        services: TaskServices,
        settings: EngineSettings,
    ) -> Self {
        let (changed, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                workers: Arc::new(Semaphore::new(settings.workers.max(1))),
                services,
                settings,
                task_locks: KeyedLocks::new(),
                changed,
            }),
        }
    }

    /// Collaborators handed to stage handlers.
    #[must_use]
    pub fn services(&self) -> &TaskServices {
        &self.inner.services
    }

    /// Engine tunables.
    #[must_use]
    pub fn settings(&self) -> EngineSettings {
        self.inner.settings
    }

    /// Creates a pending task positioned at its kind's entry stage.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::UnknownKind` for unregistered kinds, or a store error.
    pub async fn new_task(
        &self,
        kind: &str,
        target: TaskTarget,
        parent_id: Option<&str>,
        user: UserContext,
    ) -> Result<TaskHandle> {
        let record = self
            .create_record(kind, target, parent_id, user, Value::Null)
            .await?;
        Ok(TaskHandle {
            engine: self.clone(),
            id: record.id,
        })
    }

    pub(crate) async fn create_record(
        &self,
        kind: &str,
        target: TaskTarget,
        parent_id: Option<&str>,
        user: UserContext,
        params: Value,
    ) -> Result<TaskRecord> {
        let entry = self.inner.registry.entry_stage(kind)?;
        let mut record = TaskRecord::new(kind, target, entry, parent_id, user);
        record.params = params;
        self.inner.store.insert_task(record.clone()).await?;
        self.bump();
        debug!(task = %record.id, kind, target = %record.target.id, "Task created");
        Ok(record)
    }

    /// Loads a task.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::NotFound` if the task does not exist.
    pub async fn get(&self, task_id: &str) -> Result<TaskRecord> {
        self.inner
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id: task_id.to_string() }.into())
    }

    /// All tasks, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list(&self) -> Result<Vec<TaskRecord>> {
        self.inner.store.list_tasks().await
    }

    /// Tasks that have not reached a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_unfinished(&self) -> Result<Vec<TaskRecord>> {
        self.inner.store.list_unfinished().await
    }

    /// The unfinished task targeting `entity_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn active_task_for(&self, entity_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self
            .inner
            .store
            .list_unfinished()
            .await?
            .into_iter()
            .find(|t| t.target.id == entity_id))
    }

    /// Waits until the task reaches a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::WaitTimeout` after `timeout`, or `TaskError::NotFound`.
    pub async fn wait_terminal(&self, task_id: &str, timeout: Duration) -> Result<TaskRecord> {
        let mut rx = self.inner.changed.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let record = self.get(task_id).await?;
                if record.outcome.is_terminal() {
                    return Ok(record);
                }
                if rx.changed().await.is_err() {
                    return Err(ControlPlaneError::internal("Task engine shut down"));
                }
            }
        })
        .await;
        waited.map_err(|_| TaskError::WaitTimeout { id: task_id.to_string() })?
    }

    /// Resumes a suspended task with the outcome of what it awaits.
    ///
    /// Returns `false` without side effects when the task is terminal or the
    /// token does not match the pending continuation (duplicate, stale).
    ///
    /// # Errors
    ///
    /// Returns an error if the task does not exist or cannot be saved.
    pub async fn deliver(
        &self,
        task_id: &str,
        token: &str,
        outcome: std::result::Result<Value, String>,
    ) -> Result<bool> {
        let _guard = self.inner.task_locks.lock(&task_id.to_string()).await;
        let mut record = self.get(task_id).await?;

        if record.outcome.is_terminal() {
            debug!(task = %task_id, "Ignoring continuation for finished task");
            return Ok(false);
        }
        if record.awaiting.as_ref().is_none_or(|a| a.token != token) {
            debug!(task = %task_id, "Ignoring stale continuation");
            return Ok(false);
        }

        record.awaiting = None;
        record.updated_at = Utc::now();
        self.save(&record).await?;

        let input = match outcome {
            Ok(value) => StageInput::Completed(value),
            Err(reason) => StageInput::Failed(reason),
        };
        self.spawn_stage(task_id.to_string(), input);
        Ok(true)
    }

    /// Fails an unfinished task from outside its stages.
    ///
    /// Returns `false` if the task was already terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the task does not exist or cannot be saved.
    pub async fn fail_task(&self, task_id: &str, reason: &str) -> Result<bool> {
        let post = {
            let _guard = self.inner.task_locks.lock(&task_id.to_string()).await;
            let record = self.get(task_id).await?;
            if record.outcome.is_terminal() {
                return Ok(false);
            }
            self.finish_failed(record, reason.to_string()).await?
        };
        self.run_post(post).await;
        Ok(true)
    }

    /// Re-drives a pending task from its entry stage.
    ///
    /// Returns `false` if the task was claimed by someone else meanwhile.
    pub(crate) async fn redrive(&self, task_id: &str) -> Result<bool> {
        self.start(task_id, None).await
    }

    /// Claims a pending task and moves it onto the worker pool.
    ///
    /// The claim (outcome `Running`, entry stage recorded) is saved under
    /// the task lock, so only the first caller spawns the entry stage.
    async fn start(&self, task_id: &str, params: Option<Value>) -> Result<bool> {
        let input = {
            let _guard = self.inner.task_locks.lock(&task_id.to_string()).await;
            let mut record = self.get(task_id).await?;
            if record.outcome != TaskOutcome::Pending {
                warn!(task = %task_id, outcome = %record.outcome, "Task already started");
                return Ok(false);
            }
            if let Some(params) = params {
                record.params = params;
            }
            record.outcome = TaskOutcome::Running;
            let entry = record.stage.clone();
            record.enter_stage(&entry);
            self.save(&record).await?;
            StageInput::Start(record.params)
        };
        self.spawn_stage(task_id.to_string(), input);
        Ok(true)
    }

    fn bump(&self) {
        self.inner.changed.send_modify(|g| *g = g.wrapping_add(1));
    }

    async fn save(&self, record: &TaskRecord) -> Result<()> {
        self.inner.store.save_task(record).await?;
        self.bump();
        Ok(())
    }

    fn spawn_stage(&self, task_id: String, input: StageInput) {
        let engine = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&engine.inner.workers).acquire_owned().await else {
                return;
            };
            engine.run_stage(&task_id, input).await;
        });
    }

    fn launch_remote(
        &self,
        task_id: String,
        token: String,
        driver: Arc<dyn ResourceDriver>,
        adapter: Arc<dyn ProviderAdapter>,
        scope: ScopeRef,
        op: RemoteOperation,
    ) {
        let engine = self.clone();
        let deadline = self.inner.settings.remote_deadline;
        tokio::spawn(async move {
            debug!(task = %task_id, op = %op.describe(), "Remote operation started");
            let started = driver.start_remote_operation(adapter.as_ref(), &scope, &op);
            let outcome = match tokio::time::timeout(deadline, started).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(ProviderError::DeadlineExceeded {
                    operation: op.describe(),
                    deadline_secs: deadline.as_secs(),
                }
                .to_string()),
            };
            if let Err(e) = engine.deliver(&task_id, &token, outcome).await {
                error!(task = %task_id, "Failed to deliver remote outcome: {e}");
            }
        });
    }

    async fn run_stage(&self, task_id: &str, input: StageInput) {
        let post = {
            let _guard = self.inner.task_locks.lock(&task_id.to_string()).await;
            match self.step(task_id, input).await {
                Ok(post) => post,
                Err(e) => {
                    error!(task = %task_id, "Stage execution aborted: {e}");
                    return;
                }
            }
        };
        self.run_post(post).await;
    }

    async fn step(&self, task_id: &str, input: StageInput) -> Result<Vec<PostAction>> {
        let Some(mut record) = self.inner.store.get_task(task_id).await? else {
            warn!(task = %task_id, "Task vanished before its stage ran");
            return Ok(Vec::new());
        };
        if record.outcome != TaskOutcome::Running {
            debug!(task = %task_id, outcome = %record.outcome, "Task not claimed for a stage");
            return Ok(Vec::new());
        }
        if record.awaiting.is_some() {
            debug!(task = %task_id, stage = %record.stage, "Task is suspended; stray stage run ignored");
            return Ok(Vec::new());
        }

        let procedure = match self.inner.registry.get(&record.kind) {
            Ok(p) => p,
            Err(e) => return self.finish_failed(record, e.to_string()).await,
        };
        let stage = record.stage.clone();
        if !procedure.stages().contains(&stage.as_str()) {
            let reason = TaskError::UnknownStage {
                kind: record.kind.clone(),
                stage,
            }
            .to_string();
            return self.finish_failed(record, reason).await;
        }

        debug!(task = %record.id, kind = %record.kind, stage = %stage, "Running stage");
        let mut ctx = StageContext::new(self.clone(), record.clone());
        let ran = procedure.run_stage(&stage, &mut ctx, input).await;

        let transition = match ran {
            Ok(()) => ctx.transition.take().unwrap_or_else(|| {
                Transition::Failed(format!("Stage {stage} returned without a transition"))
            }),
            Err(e) => Transition::Failed(e.to_string()),
        };
        let launch = ctx.launch.take();
        let mut orphans = std::mem::take(&mut ctx.orphans);
        drop(ctx);

        let mut post = Vec::new();
        match transition {
            Transition::Stage(next) if procedure.stages().contains(&next.as_str()) => {
                record.enter_stage(&next);
                let token = Uuid::new_v4().to_string();
                let (on, deadline) = match &launch {
                    Some(Launch::Remote { op, .. }) => (
                        AwaitKind::Remote {
                            operation: op.describe(),
                        },
                        chrono::Duration::from_std(self.inner.settings.remote_deadline)
                            .ok()
                            .and_then(|d| Utc::now().checked_add_signed(d)),
                    ),
                    Some(Launch::Child { task_id }) => (
                        AwaitKind::Child {
                            task_id: task_id.clone(),
                        },
                        None,
                    ),
                    None => (AwaitKind::External, None),
                };
                record.awaiting = Some(Awaiting {
                    token: token.clone(),
                    on,
                    deadline,
                });
                self.save(&record).await?;
                if let Some(launch) = launch {
                    post.push(PostAction::Launch {
                        task_id: record.id.clone(),
                        token,
                        launch,
                    });
                }
            }
            Transition::Stage(next) => {
                let reason = TaskError::UnknownStage {
                    kind: record.kind.clone(),
                    stage: next,
                }
                .to_string();
                orphans.extend(child_of(launch));
                post.extend(self.finish_failed(record, reason).await?);
            }
            Transition::Complete(result) => {
                orphans.extend(child_of(launch));
                post.extend(self.finish_succeeded(record, result).await?);
            }
            Transition::Failed(reason) => {
                orphans.extend(child_of(launch));
                post.extend(self.finish_failed(record, reason).await?);
            }
        }

        if !orphans.is_empty() {
            post.push(PostAction::Abandon {
                task_ids: orphans,
                reason: format!("Parent task {task_id} moved on before the child started"),
            });
        }
        Ok(post)
    }

    async fn finish_succeeded(&self, mut record: TaskRecord, result: Value) -> Result<Vec<PostAction>> {
        let now = Utc::now();
        record.outcome = TaskOutcome::Succeeded;
        record.result = Some(result);
        record.awaiting = None;
        record.finished_at = Some(now);
        record.updated_at = now;
        self.save(&record).await?;
        info!(task = %record.id, kind = %record.kind, target = %record.target.name, "Task succeeded");
        Ok(parent_notice(record))
    }

    async fn finish_failed(&self, mut record: TaskRecord, reason: String) -> Result<Vec<PostAction>> {
        let now = Utc::now();
        record.outcome = TaskOutcome::Failed;
        record.failure_reason = Some(reason.clone());
        record.awaiting = None;
        record.finished_at = Some(now);
        record.updated_at = now;
        self.save(&record).await?;
        warn!(task = %record.id, kind = %record.kind, target = %record.target.name, "Task failed: {reason}");

        self.mark_target_unknown(&record, &reason).await;
        if let Err(e) = self
            .inner
            .services
            .audit
            .log_task_failed(&record.target, &record.kind, &reason, &record.user.user)
            .await
        {
            error!(task = %record.id, "Failed to audit task failure: {e}");
        }
        Ok(parent_notice(record))
    }

    async fn mark_target_unknown(&self, record: &TaskRecord, reason: &str) {
        if record.target.id == DEFAULT_ENTITY_ID {
            debug!(task = %record.id, "Default placeholder keeps its status");
            return;
        }
        let services = &self.inner.services;
        let updated = services
            .store
            .update_with_diff(&record.target.id, &|e: &mut Entity| {
                e.set_status(EntityStatus::Unknown, Some(reason));
            })
            .await;
        match updated {
            Ok((entity, changes)) if !changes.is_empty() => {
                if let Err(e) = services
                    .audit
                    .log_status(&entity, &changes, reason, &record.user.user)
                    .await
                {
                    error!(task = %record.id, "Failed to audit status change: {e}");
                }
            }
            Ok(_) => {}
            Err(ControlPlaneError::Store(StoreError::NotFound { .. })) => {
                warn!(
                    task = %record.id,
                    target = %record.target.id,
                    "Target {} {} no longer exists", record.target.kind, record.target.name
                );
            }
            Err(e) => error!(task = %record.id, "Failed to mark target unknown: {e}"),
        }
    }

    async fn run_post(&self, post: Vec<PostAction>) {
        for action in post {
            match action {
                PostAction::Launch {
                    task_id,
                    token,
                    launch,
                } => match launch {
                    Launch::Remote {
                        driver,
                        adapter,
                        scope,
                        op,
                    } => self.launch_remote(task_id, token, driver, adapter, scope, op),
                    Launch::Child { task_id: child_id } => {
                        if let Err(e) = self.start(&child_id, None).await {
                            error!(task = %task_id, child = %child_id, "Failed to start child: {e}");
                        }
                    }
                },
                PostAction::NotifyParent(child) => self.notify_parent(&child).await,
                PostAction::Abandon { task_ids, reason } => {
                    for id in task_ids {
                        self.abandon(&id, &reason).await;
                    }
                }
            }
        }
    }

    async fn notify_parent(&self, child: &TaskRecord) {
        let Some(parent_id) = child.parent_id.as_deref() else {
            return;
        };
        let parent = match self.inner.store.get_task(parent_id).await {
            Ok(Some(parent)) => parent,
            Ok(None) => {
                warn!(task = %child.id, parent = %parent_id, "Parent task missing");
                return;
            }
            Err(e) => {
                error!(task = %child.id, parent = %parent_id, "Failed to load parent: {e}");
                return;
            }
        };
        let Some(Awaiting {
            token,
            on: AwaitKind::Child { task_id },
            ..
        }) = parent.awaiting
        else {
            debug!(task = %child.id, parent = %parent_id, "Parent not waiting on a child");
            return;
        };
        if task_id != child.id {
            debug!(task = %child.id, parent = %parent_id, "Parent waits on another child");
            return;
        }

        let outcome = match child.outcome {
            TaskOutcome::Succeeded => Ok(child.result.clone().unwrap_or(Value::Null)),
            _ => Err(child.failure_reason.clone().unwrap_or_default()),
        };
        if let Err(e) = self.deliver(parent_id, &token, outcome).await {
            error!(task = %child.id, parent = %parent_id, "Failed to resume parent: {e}");
        }
    }

    async fn abandon(&self, task_id: &str, reason: &str) {
        let _guard = self.inner.task_locks.lock(&task_id.to_string()).await;
        let record = match self.get(task_id).await {
            Ok(record) if !record.outcome.is_terminal() => record,
            Ok(_) => return,
            Err(e) => {
                error!(task = %task_id, "Failed to load abandoned task: {e}");
                return;
            }
        };
        let now = Utc::now();
        let mut record = record;
        record.outcome = TaskOutcome::Failed;
        record.failure_reason = Some(reason.to_string());
        record.finished_at = Some(now);
        record.updated_at = now;
        if let Err(e) = self.save(&record).await {
            error!(task = %task_id, "Failed to save abandoned task: {e}");
        }
    }
}

fn child_of(launch: Option<Launch>) -> Option<String> {
    match launch {
        Some(Launch::Child { task_id }) => Some(task_id),
        _ => None,
    }
}

fn parent_notice(record: TaskRecord) -> Vec<PostAction> {
    if record.parent_id.is_some() {
        vec![PostAction::NotifyParent(record)]
    } else {
        Vec::new()
    }
}
