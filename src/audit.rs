//! Audit trail.
//!
//! Every lifecycle event is persisted as an append-only change-log entry and
//! mirrored on the `audit` tracing target.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::state::{ChangeLogEntry, ChangeSet, Entity, LogAction, ResourceKind, ResourceStore};
use crate::tasks::TaskTarget;

/// Writes change-log entries through the inventory store.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn ResourceStore>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Creates an audit log over a store.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        entity_id: &str,
        kind: ResourceKind,
        name: &str,
        action: LogAction,
        changes: &ChangeSet,
        note: Option<&str>,
        actor: &str,
    ) -> Result<ChangeLogEntry> {
        let entry = self
            .store
            .append_log(ChangeLogEntry {
                seq: 0,
                entity_id: entity_id.to_string(),
                entity_kind: kind,
                entity_name: name.to_string(),
                action,
                changes: changes.changes.clone(),
                note: note.map(String::from),
                actor: actor.to_string(),
                at: Utc::now(),
            })
            .await?;

        info!(
            target: "audit",
            seq = entry.seq,
            action = %action,
            kind = %kind,
            entity = %entity_id,
            name = %name,
            changes = entry.changes.len(),
            actor = %actor,
            note = note.unwrap_or_default(),
            "audit event"
        );
        Ok(entry)
    }

    /// Records that an entity was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the entry.
    pub async fn log_create(&self, entity: &Entity, actor: &str) -> Result<ChangeLogEntry> {
        self.record(
            &entity.id,
            entity.kind,
            &entity.name,
            LogAction::Create,
            &ChangeSet::default(),
            None,
            actor,
        )
        .await
    }

    /// Records mirrored fields refreshed by sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the entry.
    pub async fn log_sync_update(
        &self,
        entity: &Entity,
        changes: &ChangeSet,
        actor: &str,
    ) -> Result<ChangeLogEntry> {
        self.record(
            &entity.id,
            entity.kind,
            &entity.name,
            LogAction::SyncUpdate,
            changes,
            None,
            actor,
        )
        .await
    }

    /// Records a status change.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the entry.
    pub async fn log_status(
        &self,
        entity: &Entity,
        changes: &ChangeSet,
        note: &str,
        actor: &str,
    ) -> Result<ChangeLogEntry> {
        self.record(
            &entity.id,
            entity.kind,
            &entity.name,
            LogAction::StatusChange,
            changes,
            Some(note),
            actor,
        )
        .await
    }

    /// Records an entity disabled in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the entry.
    pub async fn log_disable(
        &self,
        entity: &Entity,
        changes: &ChangeSet,
        note: &str,
        actor: &str,
    ) -> Result<ChangeLogEntry> {
        self.record(
            &entity.id,
            entity.kind,
            &entity.name,
            LogAction::Disable,
            changes,
            Some(note),
            actor,
        )
        .await
    }

    /// Records that an entity was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the entry.
    pub async fn log_delete(&self, entity: &Entity, note: &str, actor: &str) -> Result<ChangeLogEntry> {
        self.record(
            &entity.id,
            entity.kind,
            &entity.name,
            LogAction::Delete,
            &ChangeSet::default(),
            Some(note),
            actor,
        )
        .await
    }

    /// Records a terminal task failure against its target.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the entry.
    pub async fn log_task_failed(
        &self,
        target: &TaskTarget,
        task_kind: &str,
        reason: &str,
        actor: &str,
    ) -> Result<ChangeLogEntry> {
        self.record(
            &target.id,
            target.kind,
            &target.name,
            LogAction::TaskFailed,
            &ChangeSet::default(),
            Some(&format!("{task_kind}: {reason}")),
            actor,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStore, ProviderKind, ScopeRef};

    #[tokio::test]
    async fn test_events_are_appended_in_order() {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditLog::new(store.clone());
        let entity = Entity::new(
            ResourceKind::Vm,
            ScopeRef::new(ProviderKind::Aws, "acct", "us-east-1"),
            "web",
        );

        audit.log_create(&entity, "tester").await.expect("create");
        audit
            .log_task_failed(&TaskTarget::of(&entity), "EntityCreateTask", "quota exceeded", "tester")
            .await
            .expect("task failed");

        let log = store.change_log(Some(&entity.id)).await.expect("log");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].action, LogAction::Create);
        assert_eq!(log[1].action, LogAction::TaskFailed);
        assert_eq!(
            log[1].note.as_deref(),
            Some("EntityCreateTask: quota exceeded")
        );
    }
}
