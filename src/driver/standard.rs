//! Table-driven standard driver.

use async_trait::async_trait;

use crate::error::{ControlPlaneError, Result};
use crate::state::{ProviderKind, ResourceKind};

use super::ResourceDriver;

/// Accepted size range of one storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskRange {
    /// Storage type name.
    pub storage_type: &'static str,
    /// Smallest accepted size in GB.
    pub min_gb: u32,
    /// Largest accepted size in GB.
    pub max_gb: u32,
}

const fn range(storage_type: &'static str, min_gb: u32, max_gb: u32) -> DiskRange {
    DiskRange {
        storage_type,
        min_gb,
        max_gb,
    }
}

const AWS_DISKS: &[DiskRange] = &[
    range("gp2", 1, 16384),
    range("io1", 4, 16384),
    range("st1", 500, 16384),
    range("sc1", 500, 16384),
    range("standard", 1, 1024),
];

const ALIYUN_DISKS: &[DiskRange] = &[
    range("cloud", 5, 2000),
    range("cloud_efficiency", 20, 32768),
    range("cloud_ssd", 20, 32768),
    range("cloud_essd", 20, 32768),
];

const NETWORK_CHILDREN: &[ResourceKind] = &[ResourceKind::Subnet];

/// Driver configured from static tables.
#[derive(Debug, Clone)]
pub struct StandardDriver {
    provider: ProviderKind,
    kind: ResourceKind,
    disks: &'static [DiskRange],
    grouped: bool,
    children: &'static [ResourceKind],
}

impl StandardDriver {
    /// The standard driver for a (provider, kind) pair.
    #[must_use]
    pub const fn for_pair(provider: ProviderKind, kind: ResourceKind) -> Self {
        let disks: &'static [DiskRange] = match provider {
            ProviderKind::Aws => AWS_DISKS,
            ProviderKind::Aliyun => ALIYUN_DISKS,
            ProviderKind::Gcp | ProviderKind::Azure | ProviderKind::OnPremise => &[],
        };
        let grouped = matches!(
            (provider, kind),
            (ProviderKind::Gcp, ResourceKind::Network)
        );
        let children: &'static [ResourceKind] = match kind {
            ResourceKind::Network => NETWORK_CHILDREN,
            _ => &[],
        };
        Self {
            provider,
            kind,
            disks,
            grouped,
            children,
        }
    }

    /// The storage type table of this driver.
    #[must_use]
    pub const fn disk_ranges(&self) -> &'static [DiskRange] {
        self.disks
    }
}

#[async_trait]
impl ResourceDriver for StandardDriver {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn validate_disk(&self, storage_type: &str, size_gb: u32) -> Result<()> {
        if self.disks.is_empty() {
            // No table: any named type with a positive size.
            if size_gb == 0 {
                return Err(ControlPlaneError::validation(
                    "Disk size must be at least 1GB",
                    "size_gb",
                ));
            }
            return Ok(());
        }

        let Some(range) = self.disks.iter().find(|r| r.storage_type == storage_type) else {
            return Err(ControlPlaneError::validation(
                format!("Not support create {storage_type} disk"),
                "storage_type",
            ));
        };

        if size_gb < range.min_gb || size_gb > range.max_gb {
            return Err(ControlPlaneError::validation(
                format!(
                    "The {storage_type} disk size must be in the range of {}G ~ {}GB",
                    range.min_gb, range.max_gb
                ),
                "size_gb",
            ));
        }
        Ok(())
    }

    fn belongs_to_group(&self) -> bool {
        self.grouped
    }

    fn child_kinds(&self) -> &[ResourceKind] {
        self.children
    }
}
