//! Deterministic hashing of desired state.
//!
//! The generation marker of a mark-and-sweep pass is derived from the
//! desired rows, so two passes over the same desired state agree on it.

use sha2::{Digest, Sha256};

use crate::reconciler::DesiredRow;

use super::spec::StratusConfig;

/// Length of a generation marker in hex characters.
pub const MARKER_LEN: usize = 16;

/// Hasher for generation markers and configuration fingerprints.
#[derive(Debug, Default)]
pub struct MarkerHasher;

impl MarkerHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the generation marker of a desired state.
    ///
    /// Group order matters; row order within a group does not.
    #[must_use]
    pub fn marker(&self, groups: &[Vec<DesiredRow>]) -> String {
        let mut hasher = Sha256::new();

        for group in groups {
            let mut rows: Vec<String> = group.iter().map(row_fingerprint).collect();
            rows.sort_unstable();
            hasher.update(rows.len().to_be_bytes());
            for row in rows {
                hasher.update(row.as_bytes());
                hasher.update([0u8]);
            }
        }

        let full = hex::encode(hasher.finalize());
        self.short_hash(&full, MARKER_LEN)
    }

    /// Computes a fingerprint of a configuration, used to tell whether the
    /// configuration changed between runs.
    #[must_use]
    pub fn hash_config(&self, config: &StratusConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.control_plane.name.as_bytes());

        // Providers (sorted by name for determinism)
        let mut providers: Vec<_> = config.providers.iter().collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        for provider in providers {
            hasher.update(provider.name.as_bytes());
            hasher.update(provider.kind.to_string().as_bytes());
            hasher.update(provider.account.as_bytes());
            if let Some(endpoint) = &provider.endpoint {
                hasher.update(endpoint.as_bytes());
            }
            let mut regions = provider.regions.clone();
            regions.sort();
            for region in regions {
                hasher.update(region.as_bytes());
            }
        }

        for kind in &config.sync.kinds {
            hasher.update(kind.to_string().as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Truncates a hash for display.
    #[must_use]
    pub fn short_hash(&self, hash: &str, len: usize) -> String {
        hash.chars().take(len).collect()
    }
}

/// Canonical text of one desired row.
fn row_fingerprint(row: &DesiredRow) -> String {
    let mut text = format!("{}\u{1f}{}", row.kind, row.name);
    for (column, value) in &row.columns {
        text.push('\u{1f}');
        text.push_str(column);
        text.push('=');
        text.push_str(value);
    }
    text
}
