//! Locking primitives.
//!
//! Two kinds of exclusion live here: in-process keyed locks (one async
//! mutex per scope, entity or task) and the journal lease that keeps two
//! control-plane processes from driving the same journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Lease expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Keyed async mutual exclusion.
///
/// Each key gets its own mutex; holders of different keys never contend.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: StdMutex<HashMap<K, Arc<Mutex<()>>>>,
}

/// Guard returned by [`KeyedLocks::lock`]; the key is released on drop.
#[derive(Debug)]
pub struct KeyedGuard {
    _guard: OwnedMutexGuard<()>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
        }
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> KeyedGuard {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Drop slots nobody holds or waits on.
            slots.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        KeyedGuard {
            _guard: slot.lock_owned().await,
        }
    }

    /// Returns true if `key` is currently held.
    #[must_use]
    pub fn is_locked(&self, key: &K) -> bool {
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.get(key).is_some_and(|m| m.try_lock().is_err())
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Information about a journal lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lease identifier.
    pub lock_id: String,
    /// Who holds the lease.
    pub holder: String,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lease.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Extends the lease.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().to_string(),
    );

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lease_refresh() {
        let mut lease = LockInfo::new("test-holder");
        let original_expiry = lease.expires_at;
        assert!(!lease.is_expired());
        assert!(lease.remaining_secs() > 0);

        std::thread::sleep(Duration::from_millis(10));
        lease.refresh();

        assert!(lease.expires_at >= original_expiry);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();
        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }

    #[tokio::test]
    async fn test_keyed_locks_exclude_same_key_only() {
        let locks: KeyedLocks<String> = KeyedLocks::new();
        let a = String::from("a");
        let b = String::from("b");

        let guard = locks.lock(&a).await;
        assert!(locks.is_locked(&a));
        assert!(!locks.is_locked(&b));

        let _other = locks.lock(&b).await;

        let waited =
            tokio::time::timeout(Duration::from_millis(50), locks.lock(&a)).await;
        assert!(waited.is_err());

        drop(guard);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(500), locks.lock(&a)).await;
        assert!(reacquired.is_ok());
    }
}
