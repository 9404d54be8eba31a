//! Recovery of tasks abandoned by a restart.
//!
//! Pending tasks that never started are re-driven from their entry stage.
//! Running tasks stuck past the staleness threshold, or past the deadline
//! of the remote operation they await, are failed. A parent waiting on a
//! child that is still unfinished is left to the child's own recovery.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::error::Result;

use super::engine::TaskEngine;
use super::types::{AwaitKind, TaskOutcome, TaskRecord};

/// What a recovery scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Pending tasks started again.
    pub redriven: Vec<String>,
    /// Running tasks failed.
    pub failed: Vec<String>,
}

impl RecoveryReport {
    /// Returns true if nothing needed recovery.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.redriven.is_empty() && self.failed.is_empty()
    }
}

/// Why a running task is considered abandoned, if it is.
fn abandonment(record: &TaskRecord, stale_secs: i64) -> Option<String> {
    if let Some(awaiting) = &record.awaiting {
        if let (AwaitKind::Remote { operation }, Some(deadline)) = (&awaiting.on, awaiting.deadline) {
            if deadline < Utc::now() {
                return Some(format!(
                    "Remote operation {operation} passed its deadline at {}",
                    deadline.format("%Y-%m-%d %H:%M:%S UTC")
                ));
            }
        }
    }
    let idle = record.idle_secs();
    (idle >= stale_secs).then(|| {
        format!(
            "Task abandoned in stage {} after {idle}s without progress",
            record.stage
        )
    })
}

/// The child task a suspended parent waits on.
fn awaited_child(record: &TaskRecord) -> Option<&str> {
    match record.awaiting.as_ref().map(|a| &a.on) {
        Some(AwaitKind::Child { task_id }) => Some(task_id),
        _ => None,
    }
}

/// Scans unfinished tasks and recovers the stale ones.
///
/// # Errors
///
/// Returns an error if the task store cannot be read.
pub async fn recover_stale(engine: &TaskEngine) -> Result<RecoveryReport> {
    let stale_secs = i64::try_from(engine.settings().stale_after.as_secs()).unwrap_or(i64::MAX);
    let mut report = RecoveryReport::default();

    let unfinished = engine.list_unfinished().await?;
    let open: HashSet<String> = unfinished.iter().map(|t| t.id.clone()).collect();

    for record in unfinished {
        match record.outcome {
            TaskOutcome::Pending if record.idle_secs() >= stale_secs => {
                info!(task = %record.id, kind = %record.kind, "Re-driving pending task");
                if engine.redrive(&record.id).await? {
                    report.redriven.push(record.id);
                }
            }
            TaskOutcome::Running => {
                if let Some(child) = awaited_child(&record)
                    && open.contains(child)
                {
                    debug!(task = %record.id, child = %child, "Waiting on an unfinished child");
                    continue;
                }
                let Some(reason) = abandonment(&record, stale_secs) else {
                    continue;
                };
                warn!(task = %record.id, kind = %record.kind, "{reason}");
                if engine.fail_task(&record.id, &reason).await? {
                    report.failed.push(record.id);
                }
            }
            _ => {}
        }
    }

    if !report.is_empty() {
        info!(
            redriven = report.redriven.len(),
            failed = report.failed.len(),
            "Stale task recovery finished"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EntityStatus, ResourceStore, TaskStore};
    use crate::tasks::fixtures::{Fixture, WAIT};
    use crate::tasks::types::Awaiting;
    use crate::tasks::{CONTAINER_SYNC_TASK, SYNC_STATUS_TASK, UserContext};

    fn backdated(f: &Fixture, outcome: TaskOutcome, stage: &str, idle: chrono::Duration) -> TaskRecord {
        let mut record = TaskRecord::new(
            SYNC_STATUS_TASK,
            f.target.clone(),
            "on_init",
            None,
            UserContext::system(),
        );
        record.outcome = outcome;
        if outcome == TaskOutcome::Running {
            record.enter_stage(stage);
        }
        record.created_at = record.created_at - idle;
        record.updated_at = record.updated_at - idle;
        record
    }

    #[tokio::test]
    async fn test_stale_pending_task_is_redriven() {
        let f = Fixture::builtin().await;
        let record = backdated(&f, TaskOutcome::Pending, "on_init", chrono::Duration::hours(1));
        f.store.insert_task(record.clone()).await.expect("insert");

        let report = recover_stale(&f.engine).await.expect("recover");
        assert_eq!(report.redriven, vec![record.id.clone()]);

        let finished = f.engine.wait_terminal(&record.id, WAIT).await.expect("terminal");
        assert_eq!(finished.outcome, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_running_task_past_deadline_is_failed() {
        let f = Fixture::builtin().await;
        let mut record = backdated(
            &f,
            TaskOutcome::Running,
            "on_sync_status_complete",
            chrono::Duration::seconds(5),
        );
        record.awaiting = Some(Awaiting {
            token: String::from("lost"),
            on: AwaitKind::Remote {
                operation: String::from("refresh i-1"),
            },
            deadline: Some(Utc::now() - chrono::Duration::seconds(1)),
        });
        f.store.insert_task(record.clone()).await.expect("insert");

        let report = recover_stale(&f.engine).await.expect("recover");
        assert_eq!(report.failed, vec![record.id.clone()]);

        let failed = f.engine.get(&record.id).await.expect("task");
        assert_eq!(failed.outcome, TaskOutcome::Failed);
        assert!(failed
            .failure_reason
            .expect("reason")
            .contains("refresh i-1 passed its deadline"));
        assert_eq!(
            f.store.fetch(&f.target.id).await.expect("entity").status,
            EntityStatus::Unknown
        );

        let again = recover_stale(&f.engine).await.expect("recover");
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_recent_tasks_are_left_alone() {
        let f = Fixture::builtin().await;
        let pending = backdated(&f, TaskOutcome::Pending, "on_init", chrono::Duration::zero());
        let running = backdated(
            &f,
            TaskOutcome::Running,
            "on_sync_status_complete",
            chrono::Duration::seconds(1),
        );
        f.store.insert_task(pending).await.expect("insert");
        f.store.insert_task(running).await.expect("insert");

        let report = recover_stale(&f.engine).await.expect("recover");
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_parent_of_unstarted_child_is_kept() {
        let f = Fixture::builtin().await;
        let mut parent = backdated(&f, TaskOutcome::Running, "on_status_synced", chrono::Duration::hours(1));
        parent.kind = String::from(CONTAINER_SYNC_TASK);
        let mut child = backdated(&f, TaskOutcome::Pending, "on_init", chrono::Duration::hours(1));
        child.parent_id = Some(parent.id.clone());
        parent.awaiting = Some(Awaiting {
            token: String::from("child-token"),
            on: AwaitKind::Child {
                task_id: child.id.clone(),
            },
            deadline: None,
        });
        f.store.insert_task(parent.clone()).await.expect("insert");
        f.store.insert_task(child.clone()).await.expect("insert");

        let report = recover_stale(&f.engine).await.expect("recover");
        assert_eq!(report.redriven, vec![child.id.clone()]);
        assert!(report.failed.is_empty());

        let child = f.engine.wait_terminal(&child.id, WAIT).await.expect("child");
        assert_eq!(child.outcome, TaskOutcome::Succeeded);
        let parent = f.engine.wait_terminal(&parent.id, WAIT).await.expect("parent");
        assert_eq!(parent.outcome, TaskOutcome::Succeeded, "{:?}", parent.failure_reason);
    }

    #[tokio::test]
    async fn test_redrive_claims_once() {
        let f = Fixture::builtin().await;
        f.provider.delay(crate::provider::ProviderOp::Refresh, std::time::Duration::from_millis(200));
        let record = backdated(&f, TaskOutcome::Pending, "on_init", chrono::Duration::hours(1));
        f.store.insert_task(record.clone()).await.expect("insert");

        assert!(f.engine.redrive(&record.id).await.expect("redrive"));
        let report = recover_stale(&f.engine).await.expect("recover");
        assert!(report.is_empty());

        let finished = f.engine.wait_terminal(&record.id, WAIT).await.expect("terminal");
        assert_eq!(finished.outcome, TaskOutcome::Succeeded, "{:?}", finished.failure_reason);
        assert_eq!(finished.stage_names(), vec!["on_init", "on_sync_status_complete"]);
        assert_eq!(f.provider.calls(crate::provider::ProviderOp::Refresh), 1);
    }
}
