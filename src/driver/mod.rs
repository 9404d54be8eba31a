//! Driver layer.
//!
//! A [`ResourceDriver`] is the per-(provider, resource kind) policy object
//! consumed by both engines: it validates requests before any remote call,
//! tells reconciliation whether observed resources fold into a shared group
//! or cascade into child kinds, and starts remote operations on behalf of
//! task stages. Drivers are selected from the [`DriverRegistry`] lookup table.

mod standard;

pub use standard::{DiskRange, StandardDriver};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ControlPlaneError, ProviderError, Result};
use crate::provider::{CreateSpec, ProviderAdapter};
use crate::state::{ProviderKind, ResourceKind, ScopeRef};

/// A remote operation started by a task stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RemoteOperation {
    /// Create a remote object.
    Create(CreateSpec),
    /// Delete a remote object.
    Delete {
        /// External identifier.
        external_id: String,
    },
    /// Refresh a remote object.
    Refresh {
        /// External identifier.
        external_id: String,
    },
}

impl RemoteOperation {
    /// Short description used in logs and deadline errors.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Create(spec) => format!("create {} {}", spec.kind, spec.name),
            Self::Delete { external_id } => format!("delete {external_id}"),
            Self::Refresh { external_id } => format!("refresh {external_id}"),
        }
    }
}

/// Per-(provider, resource kind) capability object.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// Provider family served.
    fn provider(&self) -> ProviderKind;

    /// Resource kind served.
    fn kind(&self) -> ResourceKind;

    /// Checks a disk request against the provider's storage type table.
    fn validate_disk(&self, storage_type: &str, size_gb: u32) -> Result<()>;

    /// Whether observed resources of this kind fold into a shared group entity.
    fn belongs_to_group(&self) -> bool;

    /// Kinds reconciled beneath an entity of this kind.
    fn child_kinds(&self) -> &[ResourceKind];

    /// Whether entities of this kind contain children.
    fn is_container(&self) -> bool {
        !self.child_kinds().is_empty()
    }

    /// Validates a create request before any entity or task exists.
    fn validate_create(&self, spec: &CreateSpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(ControlPlaneError::validation("Name cannot be empty", "name"));
        }
        if spec.kind == ResourceKind::Disk {
            let storage_type = spec.storage_type.as_deref().ok_or_else(|| {
                ControlPlaneError::validation("Disk requests need a storage type", "storage_type")
            })?;
            let size_gb = spec.size_gb.ok_or_else(|| {
                ControlPlaneError::validation("Disk requests need a size", "size_gb")
            })?;
            self.validate_disk(storage_type, size_gb)?;
        }
        Ok(())
    }

    /// Starts a remote operation and returns its result payload.
    ///
    /// `Create` yields `{"external_id": ...}`, `Refresh` yields the
    /// observation, `Delete` yields `null`.
    async fn start_remote_operation(
        &self,
        adapter: &dyn ProviderAdapter,
        scope: &ScopeRef,
        op: &RemoteOperation,
    ) -> Result<serde_json::Value> {
        match op {
            RemoteOperation::Create(spec) => {
                let external_id = adapter.create_remote(scope, spec).await?;
                Ok(serde_json::json!({ "external_id": external_id }))
            }
            RemoteOperation::Delete { external_id } => {
                adapter.delete_remote(scope, external_id).await?;
                Ok(serde_json::Value::Null)
            }
            RemoteOperation::Refresh { external_id } => {
                let observed = adapter.refresh(scope, external_id).await?;
                serde_json::to_value(observed).map_err(|e| {
                    ControlPlaneError::internal(format!("Failed to encode observation: {e}"))
                })
            }
        }
    }
}

/// Lookup table of drivers keyed on `(provider, kind)`.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<(ProviderKind, ResourceKind), Arc<dyn ResourceDriver>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers.len())
            .finish()
    }
}

impl DriverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the standard driver for every pair.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for provider in ProviderKind::ALL {
            for kind in ResourceKind::ALL {
                registry.register(Arc::new(StandardDriver::for_pair(provider, kind)));
            }
        }
        registry
    }

    /// Registers (or replaces) a driver under its own pair.
    pub fn register(&mut self, driver: Arc<dyn ResourceDriver>) {
        self.drivers.insert((driver.provider(), driver.kind()), driver);
    }

    /// Gets the driver for a pair.
    ///
    /// # Errors
    ///
    /// Returns an error if no driver is registered.
    pub fn get(&self, provider: ProviderKind, kind: ResourceKind) -> Result<Arc<dyn ResourceDriver>> {
        self.drivers
            .get(&(provider, kind))
            .cloned()
            .ok_or_else(|| {
                ProviderError::Unsupported {
                    provider: format!("{provider} {kind}"),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProviderAdapter;

    fn disk_spec(storage_type: &str, size_gb: u32) -> CreateSpec {
        CreateSpec {
            kind: ResourceKind::Disk,
            name: String::from("data"),
            size_gb: Some(size_gb),
            storage_type: Some(storage_type.to_string()),
            parent_external_id: None,
            tags: Default::default(),
        }
    }

    #[test]
    fn test_registry_covers_every_pair() {
        let registry = DriverRegistry::with_defaults();
        for provider in ProviderKind::ALL {
            for kind in ResourceKind::ALL {
                let driver = registry.get(provider, kind).expect("driver registered");
                assert_eq!(driver.provider(), provider);
                assert_eq!(driver.kind(), kind);
            }
        }
        assert!(DriverRegistry::new().get(ProviderKind::Aws, ResourceKind::Vm).is_err());
    }

    #[test]
    fn test_validate_create_rejects_before_remote_call() {
        let registry = DriverRegistry::with_defaults();
        let driver = registry
            .get(ProviderKind::Aws, ResourceKind::Disk)
            .expect("driver");

        assert!(driver.validate_create(&disk_spec("gp2", 100)).is_ok());
        let err = driver
            .validate_create(&disk_spec("io1", 2))
            .expect_err("io1 minimum is 4GB");
        assert!(err.to_string().contains("4G ~ 16384GB"));

        let mut missing_size = disk_spec("gp2", 1);
        missing_size.size_gb = None;
        assert!(driver.validate_create(&missing_size).is_err());
    }

    #[tokio::test]
    async fn test_start_remote_create_uses_adapter() {
        let mut adapter = MockProviderAdapter::new();
        adapter
            .expect_create_remote()
            .withf(|_, spec| spec.name == "data")
            .times(1)
            .returning(|_, _| Ok(String::from("vol-123")));

        let driver = StandardDriver::for_pair(ProviderKind::Aws, ResourceKind::Disk);
        let scope = ScopeRef::new(ProviderKind::Aws, "acct", "us-east-1");
        let payload = driver
            .start_remote_operation(
                &adapter,
                &scope,
                &RemoteOperation::Create(disk_spec("gp2", 10)),
            )
            .await
            .expect("create");

        assert_eq!(payload["external_id"], "vol-123");
    }

    #[tokio::test]
    async fn test_start_remote_failure_is_propagated() {
        let mut adapter = MockProviderAdapter::new();
        adapter
            .expect_delete_remote()
            .returning(|_, _| Err(ProviderError::rejected("volume in use").into()));

        let driver = StandardDriver::for_pair(ProviderKind::Aws, ResourceKind::Disk);
        let scope = ScopeRef::new(ProviderKind::Aws, "acct", "us-east-1");
        let err = driver
            .start_remote_operation(
                &adapter,
                &scope,
                &RemoteOperation::Delete {
                    external_id: String::from("vol-1"),
                },
            )
            .await
            .expect_err("delete should fail");
        assert_eq!(err.to_string(), "volume in use");
    }
}
