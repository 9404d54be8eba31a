//! Local file-based journal backend.
//!
//! Snapshots are written to a temporary file, synced, then renamed over the
//! previous snapshot, so a crash never leaves a half-written journal.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

use super::journal::{JournalBackend, JournalSnapshot, claim_lease, extend_lease};
use super::lock::{LOCK_EXPIRY_SECS, LockInfo};

/// Default journal directory name.
const JOURNAL_DIR: &str = ".stratus";

/// Journal file name.
const JOURNAL_FILE: &str = "journal.json";

/// Lease file name.
const LEASE_FILE: &str = "journal.lease";

/// Local file-based journal.
#[derive(Debug)]
pub struct LocalJournal {
    /// Base directory for journal files.
    base_dir: PathBuf,
    /// Path to the journal file.
    journal_path: PathBuf,
    /// Path to the lease file.
    lease_path: PathBuf,
}

impl LocalJournal {
    /// Creates a journal in the user's data directory, falling back to the
    /// current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no base directory can be determined.
    pub fn new() -> Result<Self> {
        let base_dir = match dirs::data_local_dir() {
            Some(dir) => dir.join("stratus"),
            None => std::env::current_dir()?.join(JOURNAL_DIR),
        };

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a journal in a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let journal_path = base_dir.join(JOURNAL_FILE);
        let lease_path = base_dir.join(LEASE_FILE);

        Self {
            base_dir,
            journal_path,
            lease_path,
        }
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.journal_path
    }

    /// Ensures the journal directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating journal directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StoreError::backend(format!("Failed to create journal directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` atomically.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StoreError::backend(format!("Failed to create {}: {e}", temp_path.display())))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StoreError::backend(format!("Failed to write {}: {e}", temp_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::backend(format!("Failed to sync {}: {e}", temp_path.display())))?;
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StoreError::backend(format!("Failed to rename {}: {e}", temp_path.display())))?;
        Ok(())
    }

    /// Reads the lease file if it exists.
    async fn read_lease_file(&self) -> Result<Option<LockInfo>> {
        if !self.lease_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lease_path).await.map_err(|e| {
            StoreError::Corrupted {
                message: format!("Failed to read lease file: {e}"),
            }
        })?;

        let lease: LockInfo = serde_json::from_str(&content).map_err(|e| StoreError::Corrupted {
            message: format!("Failed to parse lease file: {e}"),
        })?;

        Ok(Some(lease))
    }

    /// Writes the lease file.
    async fn write_lease(&self, lease: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lease)
            .map_err(|e| StoreError::serialization(format!("Failed to serialize lease: {e}")))?;
        self.write_atomic(&self.lease_path, &content)
            .await
            .map_err(|e| StoreError::LockFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl JournalBackend for LocalJournal {
    async fn load(&self) -> Result<Option<JournalSnapshot>> {
        if !self.journal_path.exists() {
            debug!("Journal does not exist: {}", self.journal_path.display());
            return Ok(None);
        }

        info!("Loading journal from: {}", self.journal_path.display());

        let content = fs::read_to_string(&self.journal_path).await.map_err(|e| {
            StoreError::Corrupted {
                message: format!("Failed to read journal: {e}"),
            }
        })?;

        JournalSnapshot::decode(&content).map(Some)
    }

    async fn save(&self, snapshot: &JournalSnapshot) -> Result<()> {
        let content = snapshot.encode()?;
        self.write_atomic(&self.journal_path, &content).await?;
        debug!(
            entities = snapshot.entities.len(),
            tasks = snapshot.tasks.len(),
            "Journal saved"
        );
        Ok(())
    }

    async fn acquire_lease(&self, holder: &str) -> Result<LockInfo> {
        let lease = claim_lease(self.read_lease_file().await?, holder)?;
        self.write_lease(&lease).await?;
        info!(
            "Acquired journal lease: {} (expires in {}s)",
            lease.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lease)
    }

    async fn renew_lease(&self, lock_id: &str) -> Result<LockInfo> {
        let lease = extend_lease(self.read_lease_file().await?, lock_id)?;
        self.write_lease(&lease).await?;
        debug!(lock_id, expires_at = %lease.expires_at, "Renewed journal lease");
        Ok(lease)
    }

    async fn release_lease(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lease_file().await? {
            if existing.lock_id == lock_id {
                fs::remove_file(&self.lease_path).await.map_err(|e| StoreError::LockFailed {
                    message: format!("Failed to delete lease file: {e}"),
                })?;
                info!("Released journal lease: {lock_id}");
            } else {
                debug!(
                    "Lease ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn break_lease(&self) -> Result<()> {
        if self.lease_path.exists() {
            fs::remove_file(&self.lease_path).await.map_err(|e| StoreError::LockFailed {
                message: format!("Failed to delete lease file: {e}"),
            })?;
            info!("Lease file removed: {}", self.lease_path.display());
        }
        Ok(())
    }

    async fn lease_info(&self) -> Result<Option<LockInfo>> {
        self.read_lease_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Entity, ResourceKind, ScopeRef};
    use tempfile::TempDir;

    fn create_test_journal() -> (LocalJournal, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let journal = LocalJournal::with_base_dir(temp_dir.path());
        (journal, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (journal, _temp) = create_test_journal();

        let mut snapshot = JournalSnapshot::empty();
        snapshot.entities.push(Entity::new(
            ResourceKind::Network,
            ScopeRef::on_premise(),
            "lan",
        ));
        journal.save(&snapshot).await.expect("Failed to save journal");

        let loaded = journal
            .load()
            .await
            .expect("Failed to load journal")
            .expect("Journal should exist");

        assert_eq!(loaded.entities.len(), 1);
        assert_eq!(loaded.entities[0].name, "lan");
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (journal, _temp) = create_test_journal();
        assert!(journal.load().await.expect("Load should not fail").is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let (journal, temp) = create_test_journal();

        let mut snapshot = JournalSnapshot::empty();
        snapshot.version = String::from("0.1");
        let content = serde_json::to_string(&snapshot).expect("serialize");
        std::fs::write(temp.path().join(JOURNAL_FILE), content).expect("write");

        assert!(journal.load().await.is_err());
    }

    #[tokio::test]
    async fn test_lease_acquire_release() {
        let (journal, _temp) = create_test_journal();

        let lease = journal
            .acquire_lease("test-holder")
            .await
            .expect("Failed to acquire lease");
        assert!(journal.lease_info().await.expect("lease info").is_some());

        journal
            .release_lease(&lease.lock_id)
            .await
            .expect("Failed to release lease");
        assert!(journal.lease_info().await.expect("lease info").is_none());
    }

    #[tokio::test]
    async fn test_lease_conflict() {
        let (journal, _temp) = create_test_journal();

        let _lease = journal
            .acquire_lease("holder-1")
            .await
            .expect("Failed to acquire first lease");

        assert!(journal.acquire_lease("holder-2").await.is_err());
    }

    #[tokio::test]
    async fn test_lease_renewal_extends_expiry() {
        let (journal, _temp) = create_test_journal();

        let lease = journal.acquire_lease("holder-1").await.expect("acquire");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let renewed = journal.renew_lease(&lease.lock_id).await.expect("renew");
        assert_eq!(renewed.lock_id, lease.lock_id);
        assert!(renewed.expires_at > lease.expires_at);

        let stored = journal.lease_info().await.expect("info").expect("lease");
        assert_eq!(stored.expires_at, renewed.expires_at);

        assert!(journal.renew_lease("not-mine").await.is_err());
        journal.release_lease(&lease.lock_id).await.expect("release");
        assert!(journal.renew_lease(&lease.lock_id).await.is_err());
    }
}
