//! Task procedures and their dispatch table.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, TaskError};

use super::context::StageContext;

/// What a stage is resumed with.
#[derive(Debug, Clone, PartialEq)]
pub enum StageInput {
    /// First run of the entry stage, with the scheduling parameters.
    Start(Value),
    /// The awaited remote operation or child task succeeded.
    Completed(Value),
    /// The awaited remote operation or child task failed.
    Failed(String),
}

/// A named multi-stage procedure.
///
/// Stage sequencing is declared entirely by the running stage through the
/// [`StageContext`]; the engine never picks the next stage itself.
#[async_trait]
pub trait TaskProcedure: Send + Sync {
    /// Task kind this procedure runs.
    fn kind(&self) -> &'static str;

    /// Declared stages; the first one is the entry stage.
    fn stages(&self) -> &'static [&'static str];

    /// Runs one stage.
    ///
    /// Returning an error fails the task with the error's message.
    async fn run_stage(&self, stage: &str, ctx: &mut StageContext, input: StageInput) -> Result<()>;
}

/// Dispatch table of procedures keyed on task kind.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    procedures: HashMap<&'static str, Arc<dyn TaskProcedure>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.procedures.keys().collect();
        kinds.sort_unstable();
        f.debug_struct("TaskRegistry").field("kinds", &kinds).finish()
    }
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a procedure under its kind.
    pub fn register(&mut self, procedure: Arc<dyn TaskProcedure>) {
        self.procedures.insert(procedure.kind(), procedure);
    }

    /// Looks up a procedure.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::UnknownKind` if nothing is registered under `kind`.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn TaskProcedure>> {
        self.procedures
            .get(kind)
            .cloned()
            .ok_or_else(|| TaskError::UnknownKind { kind: kind.to_string() }.into())
    }

    /// Entry stage of a kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is unknown or declares no stages.
    pub fn entry_stage(&self, kind: &str) -> Result<&'static str> {
        let procedure = self.get(kind)?;
        procedure.stages().first().copied().ok_or_else(|| {
            TaskError::UnknownStage {
                kind: kind.to_string(),
                stage: String::from("<entry>"),
            }
            .into()
        })
    }
}
