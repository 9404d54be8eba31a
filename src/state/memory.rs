//! In-memory inventory with optional journal persistence.
//!
//! `MemoryStore` is the authoritative inventory used by the engines. Every
//! mutation is applied in memory first and then, when a journal is attached,
//! written through as a full snapshot.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::error::{ConflictError, Result, StoreError};
use crate::tasks::TaskRecord;

use super::journal::{JournalBackend, JournalSnapshot};
use super::lock::KeyedLocks;
use super::store::{Mutator, ResourceStore, TaskStore};
use super::types::{ChangeLogEntry, ChangeSet, Entity, ResourceKind, ScopeRef};

#[derive(Debug, Default)]
struct Inventory {
    entities: BTreeMap<String, Entity>,
    log: Vec<ChangeLogEntry>,
    tasks: BTreeMap<String, TaskRecord>,
    next_seq: u64,
}

impl Inventory {
    fn external_id_holder(&self, scope: &ScopeRef, external_id: &str) -> Option<&Entity> {
        self.entities
            .values()
            .find(|e| &e.scope == scope && e.external_id.as_deref() == Some(external_id))
    }

    fn dependents_of(&self, id: &str) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(move |e| {
            e.id != id
                && (e.parent_id.as_deref() == Some(id) || e.group_id.as_deref() == Some(id))
        })
    }

    fn snapshot(&self) -> JournalSnapshot {
        let mut tasks: Vec<TaskRecord> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        JournalSnapshot {
            entities: self.entities.values().cloned().collect(),
            change_log: self.log.clone(),
            tasks,
            ..JournalSnapshot::empty()
        }
    }
}

/// In-memory implementation of [`ResourceStore`] and [`TaskStore`].
pub struct MemoryStore {
    inner: RwLock<Inventory>,
    entity_locks: KeyedLocks<String>,
    journal: Option<Arc<dyn JournalBackend>>,
    persist_lock: Mutex<()>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field(
                "journal",
                &self.journal.as_ref().map(|j| j.backend_type()),
            )
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Creates an empty, non-persistent store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inventory {
                next_seq: 1,
                ..Inventory::default()
            }),
            entity_locks: KeyedLocks::new(),
            journal: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Opens a store backed by a journal, restoring the last snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read.
    pub async fn open(journal: Arc<dyn JournalBackend>) -> Result<Self> {
        let mut inventory = Inventory {
            next_seq: 1,
            ..Inventory::default()
        };

        if let Some(snapshot) = journal.load().await? {
            inventory.next_seq = snapshot.change_log.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
            inventory.entities = snapshot
                .entities
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect();
            inventory.log = snapshot.change_log;
            inventory.tasks = snapshot
                .tasks
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect();
            info!(
                backend = journal.backend_type(),
                entities = inventory.entities.len(),
                tasks = inventory.tasks.len(),
                "Inventory restored from journal"
            );
        }

        Ok(Self {
            inner: RwLock::new(inventory),
            entity_locks: KeyedLocks::new(),
            journal: Some(journal),
            persist_lock: Mutex::new(()),
        })
    }

    /// The attached journal, if any.
    #[must_use]
    pub fn journal(&self) -> Option<&Arc<dyn JournalBackend>> {
        self.journal.as_ref()
    }

    /// Creates the default placeholder entity if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub async fn ensure_default_placeholder(&self) -> Result<Entity> {
        {
            let mut inner = self.inner.write().await;
            if let Some(existing) = inner.entities.get(super::types::DEFAULT_ENTITY_ID) {
                return Ok(existing.clone());
            }
            let placeholder = Entity::default_placeholder();
            inner
                .entities
                .insert(placeholder.id.clone(), placeholder);
        }
        self.persist().await?;
        self.fetch(super::types::DEFAULT_ENTITY_ID).await
    }

    /// Writes a snapshot through to the journal.
    async fn persist(&self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let _serial = self.persist_lock.lock().await;
        let snapshot = self.inner.read().await.snapshot();
        journal.save(&snapshot).await.inspect_err(|e| {
            error!("Failed to persist inventory: {e}");
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.inner.read().await.entities.get(id).cloned())
    }

    async fn list_by_scope(&self, scope: &ScopeRef) -> Result<Vec<Entity>> {
        let inner = self.inner.read().await;
        let mut entities: Vec<Entity> = inner
            .entities
            .values()
            .filter(|e| &e.scope == scope)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entities)
    }

    async fn list_all(&self) -> Result<Vec<Entity>> {
        Ok(self.inner.read().await.entities.values().cloned().collect())
    }

    async fn insert(&self, entity: Entity) -> Result<Entity> {
        {
            let mut inner = self.inner.write().await;
            if inner.entities.contains_key(&entity.id) {
                return Err(StoreError::Duplicate {
                    what: String::from("entity id"),
                    key: entity.id,
                }
                .into());
            }
            if let Some(ext) = &entity.external_id {
                if let Some(holder) = inner.external_id_holder(&entity.scope, ext) {
                    return Err(StoreError::Duplicate {
                        what: format!("external id in {}", entity.scope),
                        key: format!("{ext} (held by {})", holder.id),
                    }
                    .into());
                }
            }
            debug!("Inserting {}", entity.short_desc());
            inner.entities.insert(entity.id.clone(), entity.clone());
        }
        self.persist().await?;
        Ok(entity)
    }

    async fn update_with_diff(&self, id: &str, mutator: Mutator<'_>) -> Result<(Entity, ChangeSet)> {
        let key = id.to_string();
        let _guard = self.entity_locks.lock(&key).await;

        let before = self
            .inner
            .read()
            .await
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("entity", id))?;

        let mut after = before.clone();
        mutator(&mut after);
        after.id = before.id.clone();

        let changes = Entity::diff(&before, &after);
        if changes.is_empty() && after.status_reason == before.status_reason {
            return Ok((before, changes));
        }
        after.updated_at = Utc::now();

        {
            let mut inner = self.inner.write().await;
            if !inner.entities.contains_key(id) {
                return Err(StoreError::not_found("entity", id).into());
            }
            if let Some(ext) = &after.external_id {
                if let Some(holder) = inner.external_id_holder(&after.scope, ext) {
                    if holder.id != after.id {
                        return Err(StoreError::Duplicate {
                            what: format!("external id in {}", after.scope),
                            key: format!("{ext} (held by {})", holder.id),
                        }
                        .into());
                    }
                }
            }
            inner.entities.insert(after.id.clone(), after.clone());
        }
        self.persist().await?;
        Ok((after, changes))
    }

    async fn delete(&self, id: &str) -> Result<Entity> {
        let key = id.to_string();
        let _guard = self.entity_locks.lock(&key).await;

        let removed = {
            let mut inner = self.inner.write().await;
            let entity = inner
                .entities
                .get(id)
                .ok_or_else(|| StoreError::not_found("entity", id))?;
            if entity.is_default_placeholder() {
                return Err(ConflictError::ProtectedDefault { id: id.to_string() }.into());
            }
            let count = inner.dependents_of(id).count();
            if count > 0 {
                return Err(ConflictError::HasDependents {
                    kind: entity.kind.to_string(),
                    id: id.to_string(),
                    count,
                }
                .into());
            }
            inner
                .entities
                .remove(id)
                .ok_or_else(|| StoreError::not_found("entity", id))?
        };
        debug!("Deleted {}", removed.short_desc());
        self.persist().await?;
        Ok(removed)
    }

    async fn count_dependents(&self, id: &str) -> Result<usize> {
        Ok(self.inner.read().await.dependents_of(id).count())
    }

    async fn dependents(&self, id: &str) -> Result<Vec<Entity>> {
        Ok(self
            .inner
            .read()
            .await
            .dependents_of(id)
            .cloned()
            .collect())
    }

    async fn find_by_external_id(
        &self,
        scope: &ScopeRef,
        external_id: &str,
    ) -> Result<Option<Entity>> {
        Ok(self
            .inner
            .read()
            .await
            .external_id_holder(scope, external_id)
            .cloned())
    }

    async fn name_taken(&self, scope: &ScopeRef, kind: ResourceKind, name: &str) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .entities
            .values()
            .any(|e| &e.scope == scope && e.kind == kind && e.name == name))
    }

    async fn append_log(&self, mut entry: ChangeLogEntry) -> Result<ChangeLogEntry> {
        {
            let mut inner = self.inner.write().await;
            entry.seq = inner.next_seq;
            inner.next_seq += 1;
            inner.log.push(entry.clone());
        }
        self.persist().await?;
        Ok(entry)
    }

    async fn change_log(&self, entity_id: Option<&str>) -> Result<Vec<ChangeLogEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .log
            .iter()
            .filter(|e| entity_id.is_none_or(|id| e.entity_id == id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, record: TaskRecord) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.tasks.contains_key(&record.id) {
                return Err(StoreError::Duplicate {
                    what: String::from("task id"),
                    key: record.id,
                }
                .into());
            }
            inner.tasks.insert(record.id.clone(), record);
        }
        self.persist().await
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.inner.read().await.tasks.get(id).cloned())
    }

    async fn save_task(&self, record: &TaskRecord) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if !inner.tasks.contains_key(&record.id) {
                return Err(StoreError::not_found("task", record.id.as_str()).into());
            }
            inner.tasks.insert(record.id.clone(), record.clone());
        }
        self.persist().await
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self.inner.read().await.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlPlaneError;
    use crate::state::{EntityStatus, LocalJournal, LogAction, ProviderKind};
    use tempfile::TempDir;

    fn scope() -> ScopeRef {
        ScopeRef::new(ProviderKind::Aws, "acct", "us-east-1")
    }

    fn network(name: &str, ext: Option<&str>) -> Entity {
        let mut e = Entity::new(ResourceKind::Network, scope(), name);
        e.external_id = ext.map(String::from);
        e
    }

    #[tokio::test]
    async fn test_external_id_is_unique_per_scope() {
        let store = MemoryStore::new();
        store
            .insert(network("a", Some("vpc-1")))
            .await
            .expect("first insert");

        let dup = store.insert(network("b", Some("vpc-1"))).await;
        assert!(matches!(dup, Err(ControlPlaneError::Store(StoreError::Duplicate { .. }))));

        let mut other_scope = network("c", Some("vpc-1"));
        other_scope.scope = ScopeRef::new(ProviderKind::Aws, "acct", "eu-west-1");
        store.insert(other_scope).await.expect("other scope is fine");
    }

    #[tokio::test]
    async fn test_update_with_diff_reports_changes() {
        let store = MemoryStore::new();
        let entity = store
            .insert(network("a", Some("vpc-1")))
            .await
            .expect("insert");

        let (updated, changes) = store
            .update_with_diff(&entity.id, &|e: &mut Entity| {
                e.status = EntityStatus::Available;
            })
            .await
            .expect("update");
        assert_eq!(updated.status, EntityStatus::Available);
        assert!(changes.touches("status"));

        let (_, unchanged) = store
            .update_with_diff(&entity.id, &|e: &mut Entity| {
                e.status = EntityStatus::Available;
            })
            .await
            .expect("update");
        assert!(unchanged.is_empty());
    }

    #[tokio::test]
    async fn test_delete_refuses_with_dependents() {
        let store = MemoryStore::new();
        let parent = store.insert(network("net", None)).await.expect("insert");
        let mut child = Entity::new(ResourceKind::Subnet, scope(), "sub");
        child.parent_id = Some(parent.id.clone());
        let child = store.insert(child).await.expect("insert");

        let refused = store.delete(&parent.id).await;
        assert!(matches!(
            refused,
            Err(ControlPlaneError::Conflict(ConflictError::HasDependents { count: 1, .. }))
        ));
        assert_eq!(store.count_dependents(&parent.id).await.expect("count"), 1);

        store.delete(&child.id).await.expect("delete child");
        store.delete(&parent.id).await.expect("delete parent");
        assert!(store.get(&parent.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_default_placeholder_is_protected() {
        let store = MemoryStore::new();
        let placeholder = store
            .ensure_default_placeholder()
            .await
            .expect("placeholder");
        let again = store
            .ensure_default_placeholder()
            .await
            .expect("placeholder");
        assert_eq!(placeholder.id, again.id);

        let refused = store.delete(&placeholder.id).await;
        assert!(matches!(
            refused,
            Err(ControlPlaneError::Conflict(ConflictError::ProtectedDefault { .. }))
        ));
    }

    #[tokio::test]
    async fn test_change_log_sequence() {
        let store = MemoryStore::new();
        for action in [LogAction::Create, LogAction::SyncUpdate] {
            store
                .append_log(ChangeLogEntry {
                    seq: 0,
                    entity_id: String::from("e1"),
                    entity_kind: ResourceKind::Vm,
                    entity_name: String::from("vm"),
                    action,
                    changes: Vec::new(),
                    note: None,
                    actor: String::from("test"),
                    at: Utc::now(),
                })
                .await
                .expect("append");
        }
        let log = store.change_log(Some("e1")).await.expect("log");
        assert_eq!(log.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert!(store.change_log(Some("e2")).await.expect("log").is_empty());
    }

    #[tokio::test]
    async fn test_journal_round_trip() {
        let temp = TempDir::new().expect("temp dir");
        let journal: Arc<dyn JournalBackend> = Arc::new(LocalJournal::with_base_dir(temp.path()));

        let store = MemoryStore::open(Arc::clone(&journal)).await.expect("open");
        let entity = store
            .insert(network("persisted", Some("vpc-9")))
            .await
            .expect("insert");
        drop(store);

        let reopened = MemoryStore::open(journal).await.expect("reopen");
        let restored = reopened
            .find_by_external_id(&scope(), "vpc-9")
            .await
            .expect("find")
            .expect("restored");
        assert_eq!(restored.id, entity.id);
    }
}
