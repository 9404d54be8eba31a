//! Configuration specification types for the control plane.
//!
//! This module defines the structs that map to the `stratus.yaml` file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::{ProviderKind, ResourceKind, ScopeRef};
use crate::tasks::{
    DEFAULT_REMOTE_DEADLINE_SECS, DEFAULT_STALE_TASK_SECS, DEFAULT_WORKERS, EngineSettings,
};

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StratusConfig {
    /// Control-plane identity.
    pub control_plane: ControlPlaneConfig,
    /// Journal backend.
    #[serde(default)]
    pub state: StateConfig,
    /// Task engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Provider accounts to reconcile.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// What a sync pass covers.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Control-plane identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlPlaneConfig {
    /// Name of this control plane.
    pub name: String,
}

/// Journal backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region; the AWS default chain applies when unset.
    #[serde(default)]
    pub region: Option<String>,
    /// Journal directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// Journal backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based journal.
    #[default]
    Local,
    /// AWS S3-based journal.
    S3,
}

/// Task engine tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of concurrently running stages.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Deadline of one remote operation, in seconds.
    #[serde(default = "default_remote_deadline_secs")]
    pub remote_deadline_secs: u64,
    /// Idle time after which an unfinished task is recovered, in seconds.
    #[serde(default = "default_stale_task_secs")]
    pub stale_task_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            remote_deadline_secs: default_remote_deadline_secs(),
            stale_task_secs: default_stale_task_secs(),
        }
    }
}

impl EngineConfig {
    /// Converts to the engine's settings.
    #[must_use]
    pub const fn settings(&self) -> EngineSettings {
        EngineSettings {
            workers: self.workers,
            remote_deadline: Duration::from_secs(self.remote_deadline_secs),
            stale_after: Duration::from_secs(self.stale_task_secs),
        }
    }
}

/// One provider account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Unique name of this entry.
    pub name: String,
    /// Provider family.
    pub kind: ProviderKind,
    /// Gateway endpoint; an in-process provider is used when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Provider account.
    pub account: String,
    /// Regions to reconcile.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Outbound proxy for gateway traffic; direct when empty.
    #[serde(default)]
    pub proxy: ProxySettings,
}

/// Proxy settings for one provider's gateway connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProxySettings {
    /// Proxy used for `http://` endpoints.
    #[serde(default)]
    pub http_proxy: Option<String>,
    /// Proxy used for `https://` endpoints.
    #[serde(default)]
    pub https_proxy: Option<String>,
    /// Comma-separated hosts, domains or CIDR ranges reached directly.
    #[serde(default)]
    pub no_proxy: Option<String>,
}

impl ProxySettings {
    /// True when no proxy is configured.
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        self.http_proxy.is_none() && self.https_proxy.is_none()
    }
}

impl ProviderConfig {
    /// One scope per configured region.
    #[must_use]
    pub fn scopes(&self) -> Vec<ScopeRef> {
        self.regions
            .iter()
            .map(|region| ScopeRef::new(self.kind, &self.account, region))
            .collect()
    }
}

/// What a sync pass covers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Kinds reconciled by `sync`, in order.
    #[serde(default = "default_sync_kinds")]
    pub kinds: Vec<ResourceKind>,
    /// Kinds the container cascade may reconcile.
    #[serde(default = "default_cascade_kinds")]
    pub cascade: Vec<ResourceKind>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            kinds: default_sync_kinds(),
            cascade: default_cascade_kinds(),
        }
    }
}

impl StratusConfig {
    /// Every scope of every provider entry.
    #[must_use]
    pub fn scopes(&self) -> Vec<ScopeRef> {
        self.providers.iter().flat_map(ProviderConfig::scopes).collect()
    }
}

const fn default_workers() -> usize {
    DEFAULT_WORKERS
}

const fn default_remote_deadline_secs() -> u64 {
    DEFAULT_REMOTE_DEADLINE_SECS
}

const fn default_stale_task_secs() -> u64 {
    DEFAULT_STALE_TASK_SECS
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_sync_kinds() -> Vec<ResourceKind> {
    vec![
        ResourceKind::Network,
        ResourceKind::Vm,
        ResourceKind::Disk,
        ResourceKind::Snapshot,
    ]
}

fn default_cascade_kinds() -> Vec<ResourceKind> {
    vec![ResourceKind::Subnet]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_scopes() {
        let provider = ProviderConfig {
            name: String::from("aws-main"),
            kind: ProviderKind::Aws,
            endpoint: None,
            api_key_env: None,
            account: String::from("1234"),
            regions: vec![String::from("us-east-1"), String::from("eu-west-1")],
            timeout_secs: 30,
            proxy: ProxySettings::default(),
        };
        let scopes = provider.scopes();
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[1], ScopeRef::new(ProviderKind::Aws, "1234", "eu-west-1"));
    }

    #[test]
    fn test_engine_settings() {
        let engine = EngineConfig {
            workers: 2,
            remote_deadline_secs: 60,
            stale_task_secs: 120,
        };
        let settings = engine.settings();
        assert_eq!(settings.workers, 2);
        assert_eq!(settings.remote_deadline, Duration::from_secs(60));
        assert_eq!(settings.stale_after, Duration::from_secs(120));
        assert_eq!(EngineConfig::default().settings(), EngineSettings::default());
    }
}
