//! Journal backend trait definition.
//!
//! A journal persists a full snapshot of the inventory, the change log and
//! the task records so that the control plane survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::error::{ControlPlaneError, Result, StoreError};
use crate::tasks::TaskRecord;

use super::lock::{LockInfo, generate_holder_id};
use super::types::{ChangeLogEntry, Entity};

/// Current version of the journal format.
pub const JOURNAL_VERSION: &str = "1.0";

/// Everything the control plane persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalSnapshot {
    /// Journal format version.
    pub version: String,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Inventory.
    pub entities: Vec<Entity>,
    /// Append-only change log.
    #[serde(default)]
    pub change_log: Vec<ChangeLogEntry>,
    /// Task records.
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

impl JournalSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: JOURNAL_VERSION.to_string(),
            saved_at: Utc::now(),
            entities: Vec::new(),
            change_log: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Parses a snapshot and checks its version.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not a snapshot of a known version.
    pub fn decode(content: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(content).map_err(|e| StoreError::Corrupted {
            message: format!("Failed to parse journal: {e}"),
        })?;
        if !is_readable_version(&snapshot.version) {
            return Err(StoreError::VersionMismatch {
                expected: JOURNAL_VERSION.to_string(),
                found: snapshot.version,
            }
            .into());
        }
        Ok(snapshot)
    }

    /// Serializes the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::serialization(format!("Failed to serialize journal: {e}")).into())
    }
}

/// Splits a `major.minor` version string.
fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// A snapshot is readable when it shares our major version and is not from
/// a newer minor release.
fn is_readable_version(version: &str) -> bool {
    match (parse_version(version), parse_version(JOURNAL_VERSION)) {
        (Some((major, minor)), Some((our_major, our_minor))) => {
            major == our_major && minor <= our_minor
        }
        _ => false,
    }
}

/// Hands out a fresh lease unless a live one is held by someone else.
///
/// Backends read the current lease, call this, then write the result.
///
/// # Errors
///
/// Returns [`StoreError::LockedByOther`] if `existing` has not expired.
pub(crate) fn claim_lease(existing: Option<LockInfo>, holder: &str) -> Result<LockInfo> {
    if let Some(existing) = existing {
        if !existing.is_expired() {
            return Err(StoreError::LockedByOther {
                holder: existing.holder,
                since: existing.acquired_at.to_rfc3339(),
            }
            .into());
        }
        debug!("Expired lease held by {} found, taking over", existing.holder);
    }

    let holder_id = if holder.is_empty() {
        generate_holder_id()
    } else {
        holder.to_string()
    };
    Ok(LockInfo::new(&holder_id))
}

/// Extends the lease identified by `lock_id`.
///
/// An expired lease can still be renewed by its owner as long as nobody
/// else claimed it in the meantime.
///
/// # Errors
///
/// Returns an error if the lease is gone or now belongs to another holder.
pub(crate) fn extend_lease(existing: Option<LockInfo>, lock_id: &str) -> Result<LockInfo> {
    match existing {
        Some(mut lease) if lease.lock_id == lock_id => {
            lease.refresh();
            Ok(lease)
        }
        Some(other) => Err(StoreError::LockedByOther {
            holder: other.holder,
            since: other.acquired_at.to_rfc3339(),
        }
        .into()),
        None => Err(StoreError::LockFailed {
            message: format!("Lease {lock_id} is no longer held"),
        }
        .into()),
    }
}

/// Trait for journal backends.
#[async_trait]
pub trait JournalBackend: Send + Sync {
    /// Loads the last snapshot; `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<JournalSnapshot>>;

    /// Saves a snapshot, replacing the previous one.
    async fn save(&self, snapshot: &JournalSnapshot) -> Result<()>;

    /// Acquires the process lease.
    async fn acquire_lease(&self, holder: &str) -> Result<LockInfo>;

    /// Pushes back the expiry of the lease `lock_id` owns.
    async fn renew_lease(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the lease if `lock_id` still owns it.
    async fn release_lease(&self, lock_id: &str) -> Result<()>;

    /// Removes the lease regardless of who holds it.
    async fn break_lease(&self) -> Result<()>;

    /// Gets current lease information.
    async fn lease_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Renews the lease `lock_id` every `every` until the returned handle is
/// aborted.
///
/// A failed renewal is logged and retried on the next tick; the loop stops
/// once the lease belongs to someone else.
#[must_use]
pub fn spawn_lease_keeper(
    journal: Arc<dyn JournalBackend>,
    lock_id: String,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match journal.renew_lease(&lock_id).await {
                Ok(lease) => debug!("Lease {lock_id} now expires at {}", lease.expires_at),
                Err(e @ ControlPlaneError::Store(StoreError::LockedByOther { .. })) => {
                    error!("Journal lease lost: {e}");
                    return;
                }
                Err(e) => warn!("Failed to renew journal lease: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_from_older_minor_is_readable() {
        let mut snapshot = JournalSnapshot::empty();
        snapshot.version = String::from("1.0");
        let content = snapshot.encode().expect("encode");
        assert!(JournalSnapshot::decode(&content).is_ok());
    }

    #[test]
    fn test_snapshot_from_newer_release_is_rejected() {
        for version in ["1.9", "2.0", "0.1", "latest"] {
            let mut snapshot = JournalSnapshot::empty();
            snapshot.version = version.to_string();
            let content = snapshot.encode().expect("encode");
            let err = JournalSnapshot::decode(&content).expect_err(version);
            assert!(
                matches!(
                    err,
                    crate::error::ControlPlaneError::Store(StoreError::VersionMismatch { .. })
                ),
                "{version}: {err}"
            );
        }
    }

    #[test]
    fn test_claim_lease_respects_live_holder() {
        let live = LockInfo::new("holder-1");
        assert!(claim_lease(Some(live), "holder-2").is_err());

        let mut stale = LockInfo::new("holder-1");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        let taken = claim_lease(Some(stale), "holder-2").expect("take over");
        assert_eq!(taken.holder, "holder-2");
    }

    #[test]
    fn test_extend_lease_only_for_owner() {
        let mut lease = LockInfo::new("holder-1");
        lease.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        let renewed = extend_lease(Some(lease.clone()), &lease.lock_id).expect("renew");
        assert!(!renewed.is_expired());
        assert_eq!(renewed.lock_id, lease.lock_id);

        assert!(extend_lease(Some(lease), "someone-else").is_err());
        assert!(extend_lease(None, "gone").is_err());
    }

    #[tokio::test]
    async fn test_lease_keeper_pushes_expiry_forward() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let journal: Arc<dyn JournalBackend> =
            Arc::new(crate::state::LocalJournal::with_base_dir(dir.path()));
        let lease = journal.acquire_lease("keeper").await.expect("acquire");

        let keeper = spawn_lease_keeper(
            journal.clone(),
            lease.lock_id.clone(),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        keeper.abort();

        let stored = journal.lease_info().await.expect("info").expect("lease");
        assert_eq!(stored.lock_id, lease.lock_id);
        assert!(stored.expires_at > lease.expires_at);
    }
}
