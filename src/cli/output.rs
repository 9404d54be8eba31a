//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::control::SyncOutcome;
use crate::state::{Entity, EntityStatus, LockInfo};
use crate::tasks::{RecoveryReport, TaskOutcome, TaskRecord};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Entity row for table display.
#[derive(Tabled)]
struct EntityRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "External ID")]
    external_id: String,
}

/// Task row for table display.
#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Stage")]
    stage: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
}

/// Sync pass row for table display.
#[derive(Tabled)]
struct SyncRow {
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Removed")]
    removed: String,
    #[tabled(rename = "Common")]
    common: String,
    #[tabled(rename = "Added")]
    added: String,
    #[tabled(rename = "Failed")]
    failed: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the outcome of a sync run.
    #[must_use]
    pub fn format_sync(&self, outcomes: &[SyncOutcome]) -> String {
        match self.format {
            OutputFormat::Json => {
                let passes: Vec<SyncJson> = outcomes.iter().map(SyncJson::from).collect();
                to_json(&passes)
            }
            OutputFormat::Text => Self::format_sync_text(outcomes),
        }
    }

    fn format_sync_text(outcomes: &[SyncOutcome]) -> String {
        if outcomes.is_empty() {
            return format!("{} No scopes to sync.\n", "⚠".yellow());
        }

        let rows: Vec<SyncRow> = outcomes
            .iter()
            .map(|o| match &o.result {
                Ok(result) => SyncRow {
                    scope: o.scope.to_string(),
                    kind: o.kind.to_string(),
                    removed: result.removed.len().to_string(),
                    common: result.common.len().to_string(),
                    added: result.added.len().to_string(),
                    failed: if result.tally.is_clean() {
                        String::from("0")
                    } else {
                        result.tally.failed().to_string().red().to_string()
                    },
                },
                Err(_) => SyncRow {
                    scope: o.scope.to_string(),
                    kind: o.kind.to_string(),
                    removed: String::from("-"),
                    common: String::from("-"),
                    added: String::from("-"),
                    failed: "error".red().to_string(),
                },
            })
            .collect();

        let mut output = Table::new(rows).to_string();
        output.push('\n');

        let errors: Vec<String> = outcomes
            .iter()
            .flat_map(|o| match &o.result {
                Ok(result) => result.tally.errors.clone(),
                Err(e) => vec![format!("{} {}: {e}", o.scope, o.kind)],
            })
            .collect();
        if errors.is_empty() {
            let _ = writeln!(output, "\n{} Inventory in sync.", "✓".green());
        } else {
            let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
            for error in errors {
                let _ = writeln!(output, "   - {error}");
            }
        }
        output
    }

    /// Formats the inventory.
    #[must_use]
    pub fn format_inventory(&self, entities: &[Entity]) -> String {
        match self.format {
            OutputFormat::Json => to_json(entities),
            OutputFormat::Text => {
                if entities.is_empty() {
                    return String::from("   No entities recorded.\n");
                }
                let rows: Vec<EntityRow> = entities
                    .iter()
                    .map(|e| EntityRow {
                        id: Self::truncate(&e.id, 12),
                        kind: e.kind.to_string(),
                        name: if e.enabled {
                            e.name.clone()
                        } else {
                            format!("{} (disabled)", e.name)
                        },
                        status: Self::format_entity_status(e.status),
                        scope: e.scope.to_string(),
                        external_id: e.external_id.clone().unwrap_or_default(),
                    })
                    .collect();
                let mut output = Table::new(rows).to_string();
                let _ = writeln!(output, "\n\n{} entities", entities.len());
                output
            }
        }
    }

    /// Formats a task list.
    #[must_use]
    pub fn format_tasks(&self, tasks: &[TaskRecord]) -> String {
        match self.format {
            OutputFormat::Json => to_json(tasks),
            OutputFormat::Text => {
                if tasks.is_empty() {
                    return String::from("   No tasks.\n");
                }
                let rows: Vec<TaskRow> = tasks
                    .iter()
                    .map(|t| TaskRow {
                        id: t.id.clone(),
                        kind: t.kind.clone(),
                        target: format!("{} {}", t.target.kind, t.target.name),
                        stage: t.stage.clone(),
                        outcome: Self::format_outcome(t.outcome),
                    })
                    .collect();
                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats one task with its stage history.
    #[must_use]
    pub fn format_task(&self, task: &TaskRecord) -> String {
        match self.format {
            OutputFormat::Json => to_json(task),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nTask {} ({})", task.id, task.kind);
                let _ = writeln!(
                    output,
                    "   Target: {} {} ({})",
                    task.target.kind, task.target.name, task.target.id
                );
                let _ = writeln!(output, "   Outcome: {}", Self::format_outcome(task.outcome));
                let _ = writeln!(output, "   Requested by: {}", task.user.user);
                if let Some(parent) = &task.parent_id {
                    let _ = writeln!(output, "   Parent: {parent}");
                }
                if let Some(reason) = &task.failure_reason {
                    let _ = writeln!(output, "   Failure: {}", reason.red());
                }
                if let Some(result) = &task.result {
                    let _ = writeln!(output, "   Result: {result}");
                }
                let _ = writeln!(output, "\n   Stages:");
                for step in &task.history {
                    let _ = writeln!(
                        output,
                        "     {} {}",
                        step.at.format("%Y-%m-%d %H:%M:%S"),
                        step.stage
                    );
                }
                output
            }
        }
    }

    /// Formats a recovery report.
    #[must_use]
    pub fn format_recovery(&self, report: &RecoveryReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "redriven": report.redriven,
                "failed": report.failed,
            })),
            OutputFormat::Text => {
                if report.is_empty() {
                    return format!("{} No stale tasks.\n", "✓".green());
                }
                let mut output = String::new();
                for id in &report.redriven {
                    let _ = writeln!(output, "   {} {id}", "redriven".yellow());
                }
                for id in &report.failed {
                    let _ = writeln!(output, "   {} {id}", "failed".red());
                }
                output
            }
        }
    }

    /// Formats lease information.
    #[must_use]
    pub fn format_lease(&self, lease: Option<&LockInfo>) -> String {
        match (self.format, lease) {
            (OutputFormat::Json, lease) => to_json(&lease),
            (OutputFormat::Text, None) => String::from("Journal is not leased.\n"),
            (OutputFormat::Text, Some(lease)) => {
                let mut output = String::new();
                let _ = writeln!(output, "   Lease: {}", lease.lock_id);
                let _ = writeln!(output, "   Holder: {}", lease.holder);
                let _ = writeln!(output, "   Since: {}", lease.acquired_at);
                if lease.is_expired() {
                    let _ = writeln!(output, "   Status: {}", "expired".yellow());
                } else {
                    let _ = writeln!(output, "   Expires in: {}s", lease.remaining_secs());
                }
                output
            }
        }
    }

    /// Formats an entity status with color.
    fn format_entity_status(status: EntityStatus) -> String {
        match status {
            EntityStatus::Available => "available".green().to_string(),
            EntityStatus::Creating | EntityStatus::Syncing => status.to_string().yellow().to_string(),
            EntityStatus::Deleting | EntityStatus::Unavailable => status.to_string().red().to_string(),
            EntityStatus::Unknown => "unknown".dimmed().to_string(),
        }
    }

    /// Formats a task outcome with color.
    fn format_outcome(outcome: TaskOutcome) -> String {
        match outcome {
            TaskOutcome::Pending => "pending".dimmed().to_string(),
            TaskOutcome::Running => "running".yellow().to_string(),
            TaskOutcome::Succeeded => "succeeded".green().to_string(),
            TaskOutcome::Failed => "failed".red().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &format!("{} {message}", "✓".green()), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &format!("{} {message}", "⚠".yellow()), message)
    }

    fn message(&self, status: &str, text: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => text.to_string(),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct SyncJson {
    scope: String,
    kind: String,
    removed: usize,
    common: usize,
    added: usize,
    failed: usize,
    errors: Vec<String>,
}

impl From<&SyncOutcome> for SyncJson {
    fn from(outcome: &SyncOutcome) -> Self {
        let (removed, common, added, failed, errors) = match &outcome.result {
            Ok(r) => (
                r.removed.len(),
                r.common.len(),
                r.added.len(),
                r.tally.failed(),
                r.tally.errors.clone(),
            ),
            Err(e) => (0, 0, 0, 0, vec![e.to_string()]),
        };
        Self {
            scope: outcome.scope.to_string(),
            kind: outcome.kind.to_string(),
            removed,
            common,
            added,
            failed,
            errors,
        }
    }
}
