//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ControlPlaneError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StratusConfig;

/// Configuration parser for loading control-plane configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StratusConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ControlPlaneError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ControlPlaneError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StratusConfig> {
        let config: StratusConfig = serde_yaml::from_str(content).map_err(|e| {
            ControlPlaneError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed configuration for {} ({} provider entries)",
            config.control_plane.name,
            config.providers.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Recognized variables: `STRATUS_NAME`, `STRATUS_STATE_PATH`,
    /// `STRATUS_STATE_BUCKET`, `STRATUS_STATE_PREFIX`, `STRATUS_WORKERS`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is malformed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StratusConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies environment overrides read through `lookup`.
    fn apply_env_overrides(
        config: &mut StratusConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(name) = lookup("STRATUS_NAME") {
            debug!("Overriding control_plane.name from environment");
            config.control_plane.name = name;
        }

        if let Some(path) = lookup("STRATUS_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Some(bucket) = lookup("STRATUS_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("STRATUS_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(workers) = lookup("STRATUS_WORKERS") {
            debug!("Overriding engine.workers from environment");
            config.engine.workers = workers.parse().map_err(|_| {
                ConfigError::validation(
                    format!("STRATUS_WORKERS must be a positive integer, got '{workers}'"),
                    "engine.workers",
                )
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ControlPlaneError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads the API key named by a provider entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set.
    pub fn api_key(var: &str) -> Result<String> {
        std::env::var(var).map_err(|_| {
            ControlPlaneError::Config(ConfigError::MissingEnvVar {
                name: var.to_string(),
            })
        })
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stratus.yaml", "stratus.yml", "control-plane.yaml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ControlPlaneError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use crate::state::{ProviderKind, ResourceKind};
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
control_plane:
  name: lab
";
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("minimal config parses");
        assert_eq!(config.control_plane.name, "lab");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.engine.workers, 8);
        assert!(config.providers.is_empty());
        assert_eq!(config.sync.cascade, vec![ResourceKind::Subnet]);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
control_plane:
  name: prod-east

state:
  backend: s3
  bucket: stratus-journal
  prefix: prod-east

engine:
  workers: 16
  remote_deadline_secs: 600
  stale_task_secs: 1800

providers:
  - name: aws-main
    kind: aws
    endpoint: "https://gateway.internal/aws"
    api_key_env: AWS_GATEWAY_TOKEN
    account: "123456789012"
    regions: [us-east-1, us-west-2]
  - name: lab
    kind: onpremise
    account: lab
    regions: [rack-1]

sync:
  kinds: [network, disk]
"#;
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("full config parses");
        assert_eq!(config.state.bucket.as_deref(), Some("stratus-journal"));
        assert_eq!(config.engine.remote_deadline_secs, 600);
        assert_eq!(config.providers[0].kind, ProviderKind::Aws);
        assert_eq!(config.providers[1].kind, ProviderKind::OnPremise);
        assert_eq!(config.providers[0].timeout_secs, 30);
        assert_eq!(config.scopes().len(), 3);
        assert_eq!(config.sync.kinds, vec![ResourceKind::Network, ResourceKind::Disk]);
    }

    #[test]
    fn test_unknown_provider_kind_is_a_parse_error() {
        let yaml = r"
control_plane:
  name: lab
providers:
  - name: x
    kind: openstack
    account: a
";
        let err = ConfigParser::new().parse_yaml(yaml, None).expect_err("rejected");
        assert!(matches!(
            err,
            ControlPlaneError::Config(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new()
            .parse_yaml("control_plane:\n  name: lab\n", None)
            .expect("parses");
        let env = HashMap::from([
            ("STRATUS_NAME", "override"),
            ("STRATUS_STATE_BUCKET", "bucket"),
            ("STRATUS_WORKERS", "3"),
        ]);
        ConfigParser::apply_env_overrides(&mut config, |name| {
            env.get(name).map(|v| (*v).to_string())
        })
        .expect("overrides apply");
        assert_eq!(config.control_plane.name, "override");
        assert_eq!(config.state.bucket.as_deref(), Some("bucket"));
        assert_eq!(config.engine.workers, 3);

        let bad = HashMap::from([("STRATUS_WORKERS", "many")]);
        let err = ConfigParser::apply_env_overrides(&mut config, |name| {
            bad.get(name).map(|v| (*v).to_string())
        })
        .expect_err("rejected");
        assert!(err.to_string().contains("STRATUS_WORKERS"));
    }

    #[test]
    fn test_find_config_file_searches_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("stratus.yml"), "control_plane:\n  name: x\n")
            .expect("write");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("stratus.yml"));
    }
}
