//! Remote provider access.
//!
//! A [`ProviderAdapter`] lists, creates, deletes and refreshes remote
//! objects for one provider family. Adapters are looked up by
//! [`ProviderKind`] through the [`ProviderRegistry`].

mod http;
mod memory;

pub use http::HttpProviderAdapter;
pub use memory::{InMemoryProvider, ProviderOp};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{ProviderError, Result};
use crate::state::{EntityStatus, ProviderKind, ResourceKind, ScopeRef};

/// A remote object as reported by a provider listing or refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalObservation {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned identifier.
    pub external_id: String,
    /// Name reported by the provider.
    pub name: String,
    /// Reported status.
    pub status: EntityStatus,
    /// Size in GB, where applicable.
    #[serde(default)]
    pub size_gb: Option<u32>,
    /// Storage type, where applicable.
    #[serde(default)]
    pub storage_type: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Provider metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Whether this is the provider's default resource.
    #[serde(default)]
    pub is_default: bool,
    /// Whether the provider emulates this resource.
    #[serde(default)]
    pub is_emulated: bool,
    /// External identifier of the containing object.
    #[serde(default)]
    pub parent_external_id: Option<String>,
}

impl ExternalObservation {
    /// Creates an available observation with no optional attributes.
    #[must_use]
    pub fn new(kind: ResourceKind, external_id: &str, name: &str) -> Self {
        Self {
            kind,
            external_id: external_id.to_string(),
            name: name.to_string(),
            status: EntityStatus::Available,
            size_gb: None,
            storage_type: None,
            tags: BTreeMap::new(),
            metadata: BTreeMap::new(),
            is_default: false,
            is_emulated: false,
            parent_external_id: None,
        }
    }

    /// Sets the reported status.
    #[must_use]
    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = status;
        self
    }
}

/// What to create remotely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSpec {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Requested name.
    pub name: String,
    /// Size in GB, where applicable.
    #[serde(default)]
    pub size_gb: Option<u32>,
    /// Storage type, where applicable.
    #[serde(default)]
    pub storage_type: Option<String>,
    /// External identifier of the containing object.
    #[serde(default)]
    pub parent_external_id: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Remote API access for one provider family.
///
/// Implementations must be safe to call concurrently for different
/// external identifiers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Lists every remote object in a scope.
    async fn list_remote(&self, scope: &ScopeRef) -> Result<Vec<ExternalObservation>>;

    /// Creates a remote object and returns its external identifier.
    async fn create_remote(&self, scope: &ScopeRef, spec: &CreateSpec) -> Result<String>;

    /// Deletes a remote object.
    async fn delete_remote(&self, scope: &ScopeRef, external_id: &str) -> Result<()>;

    /// Reads the current state of one remote object.
    async fn refresh(&self, scope: &ScopeRef, external_id: &str) -> Result<ExternalObservation>;
}

/// Lookup table of adapters keyed on provider kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the adapter for a provider kind.
    pub fn register(&mut self, kind: ProviderKind, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(kind, adapter);
    }

    /// Gets the adapter for a provider kind.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter is registered.
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned().ok_or_else(|| {
            ProviderError::Unsupported {
                provider: kind.to_string(),
            }
            .into()
        })
    }

    /// Registered provider kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlPlaneError;

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderKind::OnPremise, Arc::new(InMemoryProvider::new()));

        assert!(registry.get(ProviderKind::OnPremise).is_ok());
        assert!(matches!(
            registry.get(ProviderKind::Azure),
            Err(ControlPlaneError::Provider(ProviderError::Unsupported { .. }))
        ));
        assert_eq!(registry.kinds(), vec![ProviderKind::OnPremise]);
    }

    #[test]
    fn test_observation_defaults_from_json() {
        let json = r#"{"kind":"disk","external_id":"vol-1","name":"data","status":"available"}"#;
        let obs: ExternalObservation = serde_json::from_str(json).expect("parse");
        assert_eq!(obs.kind, ResourceKind::Disk);
        assert!(obs.tags.is_empty());
        assert!(obs.parent_external_id.is_none());
    }
}
