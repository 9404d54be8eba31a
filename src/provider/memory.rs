//! In-process provider.
//!
//! Backs on-premise and emulated scopes, and doubles as a controllable
//! provider in tests: failures and latency can be injected per operation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{ProviderError, Result};
use crate::state::{ResourceKind, ScopeRef};

use super::{CreateSpec, ExternalObservation, ProviderAdapter};

/// Operations of a provider adapter, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    /// `list_remote`.
    List,
    /// `create_remote`.
    Create,
    /// `delete_remote`.
    Delete,
    /// `refresh`.
    Refresh,
}

#[derive(Debug, Default)]
struct World {
    objects: HashMap<ScopeRef, Vec<ExternalObservation>>,
    failures: HashMap<ProviderOp, String>,
    delays: HashMap<ProviderOp, Duration>,
    calls: HashMap<ProviderOp, usize>,
}

/// Provider whose remote state lives in process memory.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    world: Mutex<World>,
}

fn id_prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Network => "net",
        ResourceKind::Subnet => "subnet",
        ResourceKind::Vm => "vm",
        ResourceKind::Disk => "vol",
        ResourceKind::Snapshot => "snap",
        ResourceKind::RouteTable => "rtb",
        ResourceKind::Group => "grp",
    }
}

impl InMemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn world(&self) -> std::sync::MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or replaces an object in a scope.
    pub fn put(&self, scope: &ScopeRef, observation: ExternalObservation) {
        let mut world = self.world();
        let objects = world.objects.entry(scope.clone()).or_default();
        match objects
            .iter_mut()
            .find(|o| o.external_id == observation.external_id)
        {
            Some(existing) => *existing = observation,
            None => objects.push(observation),
        }
    }

    /// Removes an object from a scope; returns true if it existed.
    pub fn remove(&self, scope: &ScopeRef, external_id: &str) -> bool {
        let mut world = self.world();
        let Some(objects) = world.objects.get_mut(scope) else {
            return false;
        };
        let before = objects.len();
        objects.retain(|o| o.external_id != external_id);
        objects.len() != before
    }

    /// Objects currently held for a scope, in listing order.
    #[must_use]
    pub fn objects(&self, scope: &ScopeRef) -> Vec<ExternalObservation> {
        self.world().objects.get(scope).cloned().unwrap_or_default()
    }

    /// Makes every call to `op` fail with `message` until cleared.
    pub fn fail(&self, op: ProviderOp, message: &str) {
        self.world().failures.insert(op, message.to_string());
    }

    /// Stops injecting failures into `op`.
    pub fn clear_failure(&self, op: ProviderOp) {
        self.world().failures.remove(&op);
    }

    /// Delays every call to `op`.
    pub fn delay(&self, op: ProviderOp, delay: Duration) {
        self.world().delays.insert(op, delay);
    }

    /// Number of calls made to `op`.
    #[must_use]
    pub fn calls(&self, op: ProviderOp) -> usize {
        self.world().calls.get(&op).copied().unwrap_or(0)
    }

    /// Records the call, applies the injected delay, then the injected failure.
    async fn enter(&self, op: ProviderOp) -> Result<()> {
        let (delay, failure) = {
            let mut world = self.world();
            *world.calls.entry(op).or_default() += 1;
            (world.delays.get(&op).copied(), world.failures.get(&op).cloned())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(message) => Err(ProviderError::rejected(message).into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for InMemoryProvider {
    async fn list_remote(&self, scope: &ScopeRef) -> Result<Vec<ExternalObservation>> {
        self.enter(ProviderOp::List).await?;
        Ok(self.objects(scope))
    }

    async fn create_remote(&self, scope: &ScopeRef, spec: &CreateSpec) -> Result<String> {
        self.enter(ProviderOp::Create).await?;
        let external_id = format!(
            "{}-{}",
            id_prefix(spec.kind),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut observation = ExternalObservation::new(spec.kind, &external_id, &spec.name);
        observation.size_gb = spec.size_gb;
        observation.storage_type.clone_from(&spec.storage_type);
        observation.parent_external_id.clone_from(&spec.parent_external_id);
        observation.tags.clone_from(&spec.tags);
        self.put(scope, observation);
        debug!(scope = %scope, external_id = %external_id, "Created in-memory object");
        Ok(external_id)
    }

    async fn delete_remote(&self, scope: &ScopeRef, external_id: &str) -> Result<()> {
        self.enter(ProviderOp::Delete).await?;
        if self.remove(scope, external_id) {
            Ok(())
        } else {
            Err(ProviderError::NotFound {
                external_id: external_id.to_string(),
            }
            .into())
        }
    }

    async fn refresh(&self, scope: &ScopeRef, external_id: &str) -> Result<ExternalObservation> {
        self.enter(ProviderOp::Refresh).await?;
        self.objects(scope)
            .into_iter()
            .find(|o| o.external_id == external_id)
            .ok_or_else(|| {
                ProviderError::NotFound {
                    external_id: external_id.to_string(),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProviderKind;

    fn scope() -> ScopeRef {
        ScopeRef::new(ProviderKind::OnPremise, "local", "local")
    }

    #[tokio::test]
    async fn test_create_then_refresh() {
        let provider = InMemoryProvider::new();
        let spec = CreateSpec {
            kind: ResourceKind::Disk,
            name: String::from("data"),
            size_gb: Some(20),
            storage_type: None,
            parent_external_id: None,
            tags: Default::default(),
        };
        let id = provider
            .create_remote(&scope(), &spec)
            .await
            .expect("create");
        assert!(id.starts_with("vol-"));

        let observed = provider.refresh(&scope(), &id).await.expect("refresh");
        assert_eq!(observed.size_gb, Some(20));

        provider.delete_remote(&scope(), &id).await.expect("delete");
        assert!(provider.refresh(&scope(), &id).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let provider = InMemoryProvider::new();
        provider.fail(ProviderOp::List, "region unavailable");

        let err = provider
            .list_remote(&scope())
            .await
            .expect_err("list should fail");
        assert_eq!(err.to_string(), "region unavailable");
        assert_eq!(provider.calls(ProviderOp::List), 1);

        provider.clear_failure(ProviderOp::List);
        assert!(provider.list_remote(&scope()).await.is_ok());
    }
}
