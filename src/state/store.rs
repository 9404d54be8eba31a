//! Store trait definitions.
//!
//! `ResourceStore` is the inventory the engines read and mutate;
//! `TaskStore` keeps task records durable so unfinished tasks can be found
//! again after a restart.

use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::tasks::TaskRecord;

use super::types::{ChangeLogEntry, ChangeSet, Entity, ResourceKind, ScopeRef};

/// Mutator applied by [`ResourceStore::update_with_diff`].
pub type Mutator<'a> = &'a (dyn Fn(&mut Entity) + Send + Sync);

/// Inventory of locally-recorded entities.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Gets an entity by local id.
    async fn get(&self, id: &str) -> Result<Option<Entity>>;

    /// Lists the entities of one scope.
    async fn list_by_scope(&self, scope: &ScopeRef) -> Result<Vec<Entity>>;

    /// Lists every entity.
    async fn list_all(&self) -> Result<Vec<Entity>>;

    /// Inserts a new entity.
    ///
    /// Fails if the id, or the (scope, external id) pair, is already taken.
    async fn insert(&self, entity: Entity) -> Result<Entity>;

    /// Read-modify-write under per-entity exclusivity.
    ///
    /// Returns the updated entity and the fields that actually changed.
    async fn update_with_diff(&self, id: &str, mutator: Mutator<'_>) -> Result<(Entity, ChangeSet)>;

    /// Deletes an entity.
    ///
    /// Refuses with a conflict if other entities still reference it or if it
    /// is the protected default placeholder.
    async fn delete(&self, id: &str) -> Result<Entity>;

    /// Counts entities whose parent or group is `id`.
    async fn count_dependents(&self, id: &str) -> Result<usize>;

    /// Lists entities whose parent or group is `id`.
    async fn dependents(&self, id: &str) -> Result<Vec<Entity>>;

    /// Finds the entity holding an external id within a scope.
    async fn find_by_external_id(
        &self,
        scope: &ScopeRef,
        external_id: &str,
    ) -> Result<Option<Entity>>;

    /// Returns true if a name is already used by an entity of the kind in the scope.
    async fn name_taken(&self, scope: &ScopeRef, kind: ResourceKind, name: &str) -> Result<bool>;

    /// Appends a change-log entry and returns it with its sequence number.
    async fn append_log(&self, entry: ChangeLogEntry) -> Result<ChangeLogEntry>;

    /// Reads the change log, optionally for one entity.
    async fn change_log(&self, entity_id: Option<&str>) -> Result<Vec<ChangeLogEntry>>;

    /// Gets an entity, failing if it does not exist.
    async fn fetch(&self, id: &str) -> Result<Entity> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::not_found("entity", id).into())
    }
}

/// Durable task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new task record.
    async fn insert_task(&self, record: TaskRecord) -> Result<()>;

    /// Gets a task record.
    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>>;

    /// Overwrites a task record.
    async fn save_task(&self, record: &TaskRecord) -> Result<()>;

    /// Lists every task record.
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>>;

    /// Lists records whose outcome is not terminal.
    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>> {
        Ok(self
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| !t.outcome.is_terminal())
            .collect())
    }
}
