//! S3-based journal backend.
//!
//! Keeps the journal snapshot and the lease as two objects in an S3 (or
//! compatible) bucket so several operators can share one control plane.
//! Lease takeover and renewal follow the same rules as the local journal;
//! this module only moves the bytes.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

use super::journal::{JournalBackend, JournalSnapshot, claim_lease, extend_lease};
use super::lock::{LOCK_EXPIRY_SECS, LockInfo};

/// Journal object key suffix.
const JOURNAL_KEY: &str = "journal.json";

/// Lease object key suffix.
const LEASE_KEY: &str = "journal.lease";

/// S3-based journal.
#[derive(Debug)]
pub struct S3Journal {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, always empty or ending in `/`.
    prefix: String,
}

/// Normalizes a key prefix.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3Journal {
    /// Creates a journal using the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a journal with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for an object.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StoreError::backend(format!("Failed to read S3 object: {e}")))?;

                let content =
                    String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StoreError::backend(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StoreError::backend(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::backend(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Reads and parses the lease object.
    async fn read_lease(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LEASE_KEY)).await? else {
            return Ok(None);
        };
        let lease = serde_json::from_str(&content).map_err(|e| StoreError::Corrupted {
            message: format!("Failed to parse lease: {e}"),
        })?;
        Ok(Some(lease))
    }

    /// Writes the lease object.
    async fn write_lease(&self, lease: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lease)
            .map_err(|e| StoreError::serialization(format!("Failed to serialize lease: {e}")))?;
        self.put_object(&self.key(LEASE_KEY), &content).await
    }
}

#[async_trait]
impl JournalBackend for S3Journal {
    async fn load(&self) -> Result<Option<JournalSnapshot>> {
        let key = self.key(JOURNAL_KEY);
        debug!("Loading journal from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => {
                let snapshot = JournalSnapshot::decode(&json).inspect_err(|e| {
                    warn!("Refusing journal at s3://{}/{key}: {e}", self.bucket);
                })?;
                info!(
                    entities = snapshot.entities.len(),
                    tasks = snapshot.tasks.len(),
                    "Loaded journal from S3"
                );
                Ok(Some(snapshot))
            }
            None => {
                debug!("No journal found in S3");
                Ok(None)
            }
        }
    }

    async fn save(&self, snapshot: &JournalSnapshot) -> Result<()> {
        let key = self.key(JOURNAL_KEY);
        debug!("Saving journal to s3://{}/{key}", self.bucket);
        self.put_object(&key, &snapshot.encode()?).await
    }

    async fn acquire_lease(&self, holder: &str) -> Result<LockInfo> {
        let lease = claim_lease(self.read_lease().await?, holder)?;
        self.write_lease(&lease).await?;
        info!(
            "Acquired journal lease: {} (expires in {}s)",
            lease.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lease)
    }

    async fn renew_lease(&self, lock_id: &str) -> Result<LockInfo> {
        let lease = extend_lease(self.read_lease().await?, lock_id)?;
        self.write_lease(&lease).await?;
        debug!(lock_id, expires_at = %lease.expires_at, "Renewed journal lease");
        Ok(lease)
    }

    async fn release_lease(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lease().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LEASE_KEY)).await?;
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
        self.delete_object(&self.key(LEASE_KEY)).await
    }

    async fn lease_info(&self) -> Result<Option<LockInfo>> {
        self.read_lease().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
