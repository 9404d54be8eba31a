//! Configuration validation.
//!
//! Collects every error and warning in one pass, then reports the first
//! error, so `stratus validate` can list everything wrong at once.

use crate::driver::{ResourceDriver, StandardDriver};
use crate::error::{ConfigError, Result};
use crate::state::{ProviderKind, ResourceKind};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::spec::{
    EngineConfig, ProviderConfig, ProxySettings, StateBackend, StateConfig, StratusConfig,
    SyncConfig,
};

/// Validator for control-plane configurations.
#[derive(Debug)]
pub struct ConfigValidator {
    /// Kinds some container may cascade into.
    cascadable: HashSet<ResourceKind>,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// Creates a validator that knows the standard drivers' child kinds.
    #[must_use]
    pub fn new() -> Self {
        let mut cascadable = HashSet::new();
        for provider in ProviderKind::ALL {
            for kind in ResourceKind::ALL {
                cascadable.extend(StandardDriver::for_pair(provider, kind).child_kinds());
            }
        }
        Self { cascadable }
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found; warnings never fail validation.
    pub fn validate(&self, config: &StratusConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first) = result.errors.first() {
            return Err(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            }
            .into());
        }
        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Runs every check and returns all findings.
    #[must_use]
    pub fn check(&self, config: &StratusConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !is_valid_name(&config.control_plane.name) {
            result.error(
                "control_plane.name",
                format!(
                    "Control plane name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    config.control_plane.name
                ),
            );
        }
        Self::validate_state(&config.state, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_providers(&config.providers, &mut result);
        self.validate_sync(&config.sync, &mut result);

        result
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
                if state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path: ignored by the s3 backend"));
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket: ignored by the local backend"));
                }
            }
        }
    }

    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.workers == 0 {
            result.error("engine.workers", "Worker count must be at least 1");
        } else if engine.workers > 256 {
            result.warnings.push(format!(
                "engine.workers: {} workers is unusually high",
                engine.workers
            ));
        }
        if engine.remote_deadline_secs == 0 {
            result.error(
                "engine.remote_deadline_secs",
                "Remote operation deadline must be positive",
            );
        }
        if engine.stale_task_secs == 0 {
            result.error("engine.stale_task_secs", "Stale task threshold must be positive");
        } else if engine.stale_task_secs < engine.remote_deadline_secs {
            result.warnings.push(String::from(
                "engine.stale_task_secs: shorter than the remote deadline; slow operations will be abandoned early",
            ));
        }
    }

    fn validate_providers(providers: &[ProviderConfig], result: &mut ValidationResult) {
        if providers.is_empty() {
            result
                .warnings
                .push(String::from("No providers defined; sync will do nothing"));
            return;
        }

        let mut seen_names = HashSet::new();
        let mut endpoints: HashMap<ProviderKind, Option<&str>> = HashMap::new();
        for (i, provider) in providers.iter().enumerate() {
            let prefix = format!("providers[{i}]");

            if !seen_names.insert(&provider.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate provider name: {}", provider.name),
                );
            }
            if !is_valid_name(&provider.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Provider name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        provider.name
                    ),
                );
            }
            if provider.account.trim().is_empty() {
                result.error(format!("{prefix}.account"), "Account cannot be empty");
            }
            if provider.regions.is_empty() {
                result
                    .warnings
                    .push(format!("{prefix}.regions: no regions, nothing will be reconciled"));
            }
            let endpoint = provider.endpoint.as_deref();
            if let Some(first) = endpoints.insert(provider.kind, endpoint)
                && first != endpoint
            {
                result.error(
                    format!("{prefix}.endpoint"),
                    format!("All {} entries must share one endpoint", provider.kind),
                );
            }
            if provider.timeout_secs == 0 {
                result.error(format!("{prefix}.timeout_secs"), "Timeout must be positive");
            }

            match &provider.endpoint {
                Some(endpoint) => {
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                        result.error(
                            format!("{prefix}.endpoint"),
                            format!("Endpoint must be an http(s) URL: {endpoint}"),
                        );
                    } else if endpoint.starts_with("http://") {
                        result.warnings.push(format!(
                            "{prefix}.endpoint: plain http sends the API key unencrypted"
                        ));
                    }
                    if provider.api_key_env.is_none() {
                        result.error(
                            format!("{prefix}.api_key_env"),
                            "Providers with an endpoint need an API key variable",
                        );
                    }
                }
                None if provider.kind != ProviderKind::OnPremise => {
                    result.warnings.push(format!(
                        "{prefix}.endpoint: no endpoint, {} scopes use the in-process provider",
                        provider.kind
                    ));
                }
                None => {}
            }

            Self::validate_proxy(&prefix, &provider.proxy, result);
        }
    }

    fn validate_proxy(prefix: &str, proxy: &ProxySettings, result: &mut ValidationResult) {
        for (field, url) in [
            ("http_proxy", &proxy.http_proxy),
            ("https_proxy", &proxy.https_proxy),
        ] {
            if let Some(url) = url
                && !url.starts_with("http://")
                && !url.starts_with("https://")
            {
                result.error(
                    format!("{prefix}.proxy.{field}"),
                    format!("Proxy must be an http(s) URL: {url}"),
                );
            }
        }
        match &proxy.no_proxy {
            Some(list) if list.split(',').any(|host| host.trim().is_empty()) => {
                result.error(
                    format!("{prefix}.proxy.no_proxy"),
                    "Bypass list has an empty entry",
                );
            }
            Some(_) if proxy.is_direct() => {
                result
                    .warnings
                    .push(format!("{prefix}.proxy.no_proxy: set without any proxy"));
            }
            _ => {}
        }
    }

    fn validate_sync(&self, sync: &SyncConfig, result: &mut ValidationResult) {
        if sync.kinds.is_empty() {
            result.error("sync.kinds", "At least one resource kind must be synced");
        }
        for (i, kind) in sync.cascade.iter().enumerate() {
            if !self.cascadable.contains(kind) {
                result.error(
                    format!("sync.cascade[{i}]"),
                    format!("No container cascades into {kind}"),
                );
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::ControlPlaneError;

    fn parse(yaml: &str) -> StratusConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("parses")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("prod-east"));
        assert!(is_valid_name("aws-1"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Prod")); // uppercase
        assert!(!is_valid_name("1-east")); // starts with number
        assert!(!is_valid_name("prod_east")); // underscore
        assert!(!is_valid_name("prod-")); // ends with hyphen
        assert!(!is_valid_name("prod--east")); // consecutive hyphens
    }

    #[test]
    fn test_collects_every_error() {
        let config = parse(
            r"
control_plane:
  name: lab
state:
  backend: s3
engine:
  workers: 0
providers:
  - name: aws
    kind: aws
    account: a
    endpoint: ftp://gateway
    api_key_env: TOKEN
    regions: [us-east-1]
  - name: aws
    kind: aws
    account: b
    regions: [us-west-2]
sync:
  cascade: [vm]
",
        );
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "state.bucket",
                "engine.workers",
                "providers[0].endpoint",
                "providers[1].name",
                "providers[1].endpoint",
                "sync.cascade[0]",
            ]
        );

        let err = ConfigValidator::new().validate(&config).expect_err("invalid");
        assert!(matches!(
            err,
            ControlPlaneError::Config(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let config = parse(
            r"
control_plane:
  name: lab
providers:
  - name: gcp
    kind: gcp
    account: proj
    regions: [us-central1]
",
        );
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_proxy_settings_are_checked() {
        let config = parse(
            r"
control_plane:
  name: lab
providers:
  - name: aws
    kind: aws
    account: a
    endpoint: https://gateway.internal/aws
    api_key_env: TOKEN
    regions: [us-east-1]
    proxy:
      http_proxy: http://proxy.internal:3128
      https_proxy: socks5://proxy.internal:1080
      no_proxy: '10.0.0.0/8,,internal'
  - name: azure
    kind: azure
    account: b
    endpoint: https://gateway.internal/azure
    api_key_env: TOKEN
    regions: [westeurope]
    proxy:
      no_proxy: internal
",
        );
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["providers[0].proxy.https_proxy", "providers[0].proxy.no_proxy"]
        );
        assert!(
            result
                .warnings
                .iter()
                .any(|w| w.starts_with("providers[1].proxy.no_proxy"))
        );
        assert_eq!(
            config.providers[0].proxy.http_proxy.as_deref(),
            Some("http://proxy.internal:3128")
        );
    }
}
