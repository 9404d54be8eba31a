//! Task records.
//!
//! A task record is the durable program counter of one multi-stage
//! operation against one target entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::state::{Entity, ResourceKind};

/// Terminal or in-flight outcome of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    /// Created, not yet started.
    Pending,
    /// A stage is running or the task awaits a continuation.
    Running,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
}

/// Weak reference to the entity a task operates on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskTarget {
    /// Entity kind.
    pub kind: ResourceKind,
    /// Entity identifier.
    pub id: String,
    /// Entity name when the task was created.
    pub name: String,
}

/// Who initiated a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserContext {
    /// Acting user or subsystem.
    pub user: String,
    /// Project the request was made in.
    #[serde(default)]
    pub project: Option<String>,
    /// Correlation identifier.
    pub request_id: String,
}

/// One entry of a task's stage history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTransition {
    /// Stage entered.
    pub stage: String,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// What a suspended task is waiting for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AwaitKind {
    /// A dispatched remote operation.
    Remote {
        /// Operation description.
        operation: String,
    },
    /// A child task.
    Child {
        /// Child task identifier.
        task_id: String,
    },
    /// A callback from outside the engine.
    External,
}

/// Continuation a suspended task waits on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Awaiting {
    /// Token the completion must present; stale or duplicate deliveries
    /// carry a different token and are ignored.
    pub token: String,
    /// What is awaited.
    pub on: AwaitKind,
    /// Absolute deadline, if any.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

/// A persisted task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    /// Task identifier.
    pub id: String,
    /// Task kind (procedure name).
    pub kind: String,
    /// Target entity.
    pub target: TaskTarget,
    /// Current stage.
    pub stage: String,
    /// Parent task, if nested.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Outcome.
    pub outcome: TaskOutcome,
    /// Failure reason for failed tasks.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Parameters supplied at scheduling time.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Data supplied with terminal success.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Initiator.
    pub user: UserContext,
    /// Stages entered, in order.
    #[serde(default)]
    pub history: Vec<StageTransition>,
    /// Pending continuation.
    #[serde(default)]
    pub awaiting: Option<Awaiting>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When the outcome became terminal.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskOutcome {
    /// Returns true for succeeded or failed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl TaskTarget {
    /// Builds a target reference from an entity.
    #[must_use]
    pub fn of(entity: &Entity) -> Self {
        Self {
            kind: entity.kind,
            id: entity.id.clone(),
            name: entity.name.clone(),
        }
    }
}

impl UserContext {
    /// Creates a context with a fresh request id.
    #[must_use]
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            project: None,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// The context used by background subsystems.
    #[must_use]
    pub fn system() -> Self {
        Self::new("system")
    }
}

impl TaskRecord {
    /// Creates a pending record positioned at `entry_stage`.
    #[must_use]
    pub fn new(
        kind: &str,
        target: TaskTarget,
        entry_stage: &str,
        parent_id: Option<&str>,
        user: UserContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            target,
            stage: entry_stage.to_string(),
            parent_id: parent_id.map(String::from),
            outcome: TaskOutcome::Pending,
            failure_reason: None,
            params: serde_json::Value::Null,
            result: None,
            user,
            history: Vec::new(),
            awaiting: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Moves the program counter and records the transition.
    pub fn enter_stage(&mut self, stage: &str) {
        let now = Utc::now();
        stage.clone_into(&mut self.stage);
        self.history.push(StageTransition {
            stage: stage.to_string(),
            at: now,
        });
        self.updated_at = now;
    }

    /// Names of the stages entered, in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.history.iter().map(|t| t.stage.as_str()).collect()
    }

    /// Seconds since the record was last touched.
    #[must_use]
    pub fn idle_secs(&self) -> i64 {
        (Utc::now() - self.updated_at).num_seconds()
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on {} {} [{}] at {}",
            self.kind, self.id, self.target.kind, self.target.name, self.outcome, self.stage
        )
    }
}
