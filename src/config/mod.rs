//! Configuration module for the Stratus control plane.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stratus.yaml`
//! - Validation of configuration values
//! - Deterministic hashing of desired state

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::{MARKER_LEN, MarkerHasher};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    ControlPlaneConfig, EngineConfig, ProviderConfig, ProxySettings, StateBackend, StateConfig,
    StratusConfig, SyncConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
