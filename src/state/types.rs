//! Inventory types.
//!
//! These types represent the locally-recorded inventory: entities, the
//! scopes they belong to, and the append-only change log written whenever
//! an entity is created, mutated or retired.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of the default placeholder entity.
pub const DEFAULT_ENTITY_ID: &str = "default";

/// Cloud provider families.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Amazon Web Services.
    Aws,
    /// Alibaba Cloud.
    Aliyun,
    /// Google Cloud Platform.
    Gcp,
    /// Microsoft Azure.
    Azure,
    /// On-premise or emulated resources.
    OnPremise,
}

/// Kinds of synchronizable resources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual network (VPC).
    Network,
    /// Subnet inside a network.
    Subnet,
    /// Virtual machine.
    Vm,
    /// Block storage disk.
    Disk,
    /// Disk snapshot.
    Snapshot,
    /// Route table.
    RouteTable,
    /// Cross-region grouping of networks.
    Group,
}

/// Lifecycle status of an entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// Being created remotely.
    Creating,
    /// Available and in use.
    Available,
    /// Exists remotely but is not usable.
    Unavailable,
    /// Status refresh in progress.
    Syncing,
    /// Being deleted remotely.
    Deleting,
    /// Unreachable or failed; the last operation did not converge.
    Unknown,
}

/// The account/region/provider boundary of an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeRef {
    /// Provider family.
    pub provider: ProviderKind,
    /// Provider account.
    pub account: String,
    /// Provider region.
    pub region: String,
}

/// A locally-recorded, possibly remotely-mirrored resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    /// Stable local identifier.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Owning scope.
    pub scope: ScopeRef,
    /// Identifier assigned by the remote system, if any.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Natural key (display name).
    pub name: String,
    /// Lifecycle status.
    pub status: EntityStatus,
    /// Whether the entity may be used.
    pub enabled: bool,
    /// Whether the provider reports this as its default resource.
    #[serde(default)]
    pub is_default: bool,
    /// Whether the entity stands in for a resource the provider does not model.
    #[serde(default)]
    pub is_emulated: bool,
    /// Size in GB (disks, snapshots).
    #[serde(default)]
    pub size_gb: Option<u32>,
    /// Storage type (disks).
    #[serde(default)]
    pub storage_type: Option<String>,
    /// Mirrored tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Mirrored metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Containing entity.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Shared grouping entity.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Reason attached to the last status change.
    #[serde(default)]
    pub status_reason: Option<String>,
    /// When the entity was recorded.
    pub created_at: DateTime<Utc>,
    /// When the entity was last mutated.
    pub updated_at: DateTime<Utc>,
}

/// A single field difference produced by a read-modify-write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldChange {
    /// Field name.
    pub field: String,
    /// Value before the update.
    pub old: Option<String>,
    /// Value after the update.
    pub new: Option<String>,
}

/// The fields changed by one update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeSet {
    /// Changed fields in declaration order.
    pub changes: Vec<FieldChange>,
}

/// Actions recorded in the change log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    /// Entity recorded locally.
    Create,
    /// Mirrored fields refreshed from an observation.
    SyncUpdate,
    /// Status changed.
    StatusChange,
    /// Entity disabled in place.
    Disable,
    /// Entity removed.
    Delete,
    /// A task against the entity failed.
    TaskFailed,
}

/// An append-only change-log record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeLogEntry {
    /// Monotonic sequence number assigned by the store.
    pub seq: u64,
    /// Subject entity.
    pub entity_id: String,
    /// Subject kind.
    pub entity_kind: ResourceKind,
    /// Subject name at the time of the event.
    pub entity_name: String,
    /// Action.
    pub action: LogAction,
    /// Field differences, if any.
    #[serde(default)]
    pub changes: Vec<FieldChange>,
    /// Free-form note.
    #[serde(default)]
    pub note: Option<String>,
    /// Who caused the event.
    pub actor: String,
    /// When the event happened.
    pub at: DateTime<Utc>,
}

impl ScopeRef {
    /// Creates a scope reference.
    #[must_use]
    pub fn new(provider: ProviderKind, account: &str, region: &str) -> Self {
        Self {
            provider,
            account: account.to_string(),
            region: region.to_string(),
        }
    }

    /// The scope of on-premise resources.
    #[must_use]
    pub fn on_premise() -> Self {
        Self::new(ProviderKind::OnPremise, "local", "local")
    }

    /// External identifier of the emulated network standing in for a
    /// classic (network-less) deployment in this scope.
    #[must_use]
    pub fn classic_network_external_id(&self) -> String {
        format!("{}-{}", self.region, self.account)
    }
}

impl Entity {
    /// Creates a new entity with a fresh local identifier.
    #[must_use]
    pub fn new(kind: ResourceKind, scope: ScopeRef, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            scope,
            external_id: None,
            name: name.to_string(),
            status: EntityStatus::Creating,
            enabled: true,
            is_default: false,
            is_emulated: false,
            size_gb: None,
            storage_type: None,
            tags: BTreeMap::new(),
            metadata: BTreeMap::new(),
            parent_id: None,
            group_id: None,
            status_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The unmanaged placeholder used for on-premise resources.
    #[must_use]
    pub fn default_placeholder() -> Self {
        let mut entity = Self::new(ResourceKind::Network, ScopeRef::on_premise(), "Default");
        entity.id = DEFAULT_ENTITY_ID.to_string();
        entity.status = EntityStatus::Available;
        entity.is_default = true;
        entity
    }

    /// Returns true for the protected default placeholder.
    #[must_use]
    pub fn is_default_placeholder(&self) -> bool {
        self.id == DEFAULT_ENTITY_ID
    }

    /// Returns true if the entity is mirrored from a remote system.
    #[must_use]
    pub const fn is_managed(&self) -> bool {
        self.external_id.is_some()
    }

    /// Sets the status with an optional reason.
    pub fn set_status(&mut self, status: EntityStatus, reason: Option<&str>) {
        self.status = status;
        self.status_reason = reason.map(String::from);
    }

    /// Short human-readable description.
    #[must_use]
    pub fn short_desc(&self) -> String {
        format!("{} {}({})", self.kind, self.name, self.id)
    }

    /// Compares the mirrored fields of two versions of an entity.
    #[must_use]
    pub fn diff(before: &Self, after: &Self) -> ChangeSet {
        let mut set = ChangeSet::default();
        set.push("name", Some(&before.name), Some(&after.name));
        set.push(
            "external_id",
            before.external_id.as_ref(),
            after.external_id.as_ref(),
        );
        set.push(
            "status",
            Some(&before.status.to_string()),
            Some(&after.status.to_string()),
        );
        set.push(
            "enabled",
            Some(&before.enabled.to_string()),
            Some(&after.enabled.to_string()),
        );
        set.push(
            "is_default",
            Some(&before.is_default.to_string()),
            Some(&after.is_default.to_string()),
        );
        set.push(
            "is_emulated",
            Some(&before.is_emulated.to_string()),
            Some(&after.is_emulated.to_string()),
        );
        set.push(
            "size_gb",
            before.size_gb.map(|s| s.to_string()).as_ref(),
            after.size_gb.map(|s| s.to_string()).as_ref(),
        );
        set.push(
            "storage_type",
            before.storage_type.as_ref(),
            after.storage_type.as_ref(),
        );
        set.push(
            "tags",
            Some(&format!("{:?}", before.tags)),
            Some(&format!("{:?}", after.tags)),
        );
        set.push(
            "metadata",
            Some(&format!("{:?}", before.metadata)),
            Some(&format!("{:?}", after.metadata)),
        );
        set.push("parent_id", before.parent_id.as_ref(), after.parent_id.as_ref());
        set.push("group_id", before.group_id.as_ref(), after.group_id.as_ref());
        set
    }
}

impl ChangeSet {
    /// Records a change if the two values differ.
    fn push(&mut self, field: &str, old: Option<&String>, new: Option<&String>) {
        if old != new {
            self.changes.push(FieldChange {
                field: field.to_string(),
                old: old.cloned(),
                new: new.cloned(),
            });
        }
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns true if the named field changed.
    #[must_use]
    pub fn touches(&self, field: &str) -> bool {
        self.changes.iter().any(|c| c.field == field)
    }
}

impl ProviderKind {
    /// Every provider family.
    pub const ALL: [Self; 5] = [
        Self::Aws,
        Self::Aliyun,
        Self::Gcp,
        Self::Azure,
        Self::OnPremise,
    ];
}

impl ResourceKind {
    /// Every resource kind.
    pub const ALL: [Self; 7] = [
        Self::Network,
        Self::Subnet,
        Self::Vm,
        Self::Disk,
        Self::Snapshot,
        Self::RouteTable,
        Self::Group,
    ];
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown provider kind: {s}"))
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown resource kind: {s}"))
    }
}

impl FromStr for ScopeRef {
    type Err = String;

    /// Parses the `provider/account/region` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(provider), Some(account), Some(region))
                if !account.is_empty() && !region.is_empty() =>
            {
                Ok(Self::new(provider.parse()?, account, region))
            }
            _ => Err(format!("expected provider/account/region, got: {s}")),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aws => "aws",
            Self::Aliyun => "aliyun",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
            Self::OnPremise => "onpremise",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::Vm => "vm",
            Self::Disk => "disk",
            Self::Snapshot => "snapshot",
            Self::RouteTable => "route_table",
            Self::Group => "group",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::Unavailable => "unavailable",
            Self::Syncing => "syncing",
            Self::Deleting => "deleting",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.account, self.region)
    }
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::SyncUpdate => "sync_update",
            Self::StatusChange => "status_change",
            Self::Disable => "disable",
            Self::Delete => "delete",
            Self::TaskFailed => "task_failed",
        };
        write!(f, "{s}")
    }
}
