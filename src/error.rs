//! Error types for the Stratus control plane.
//!
//! This module provides the error hierarchy shared by the reconciliation
//! engine, the task engine, the driver layer and the persistence backends.
//! Every error maps onto one of four classes (validation, remote, conflict,
//! internal) which decide how far it propagates.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the control plane.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A request was rejected before any remote call was attempted.
    #[error("Validation failed: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Persistence errors.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Remote provider errors.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The operation conflicts with the current inventory.
    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// Task engine errors.
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before any remote call; nothing was mutated.
    Validation,
    /// A provider or control-plane call failed; isolated to one entity or task.
    Remote,
    /// Refused because of the current inventory; nothing was mutated.
    Conflict,
    /// Persistence or internal failure; fatal to the current operation.
    Internal,
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind.
        kind: String,
        /// Record identifier.
        id: String,
    },

    /// A second record would claim an already-used identity.
    #[error("{what} already exists: {key}")]
    Duplicate {
        /// What was duplicated.
        what: String,
        /// The duplicated key.
        key: String,
    },

    /// Journal content is corrupted.
    #[error("Journal is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Lease acquisition failed.
    #[error("Failed to acquire journal lease: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Lease is held by another process.
    #[error("Journal is leased by another process (holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lease holder.
        holder: String,
        /// When the lease was acquired.
        since: String,
    },

    /// Backend (filesystem or object store) failure.
    #[error("Journal backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },

    /// Serialization error.
    #[error("Journal serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Journal format version mismatch.
    #[error("Journal version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version.
        expected: String,
        /// Found version.
        found: String,
    },
}

/// Remote provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No adapter is registered for the provider.
    #[error("No provider adapter registered for {provider}")]
    Unsupported {
        /// Provider kind.
        provider: String,
    },

    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider refused the request (quota, invalid spec, ...).
    #[error("{message}")]
    Rejected {
        /// Message reported by the provider.
        message: String,
    },

    /// API request failed.
    #[error("Provider API request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// Rate limited.
    #[error("Provider API rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Remote object not found.
    #[error("Remote object not found: {external_id}")]
    NotFound {
        /// External identifier of the missing object.
        external_id: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the API.
    #[error("Invalid response from provider API: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// A remote operation outlived its absolute deadline.
    #[error("Remote operation {operation} exceeded its deadline of {deadline_secs}s")]
    DeadlineExceeded {
        /// Operation description.
        operation: String,
        /// Deadline length in seconds.
        deadline_secs: u64,
    },
}

/// Conflicts with the current inventory.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The entity still has dependents.
    #[error("{kind} {id} still has {count} dependent(s); delete them first")]
    HasDependents {
        /// Entity kind.
        kind: String,
        /// Entity identifier.
        id: String,
        /// Number of dependents.
        count: usize,
    },

    /// The entity is the protected default placeholder.
    #[error("{id} is the protected default entity and cannot be retired")]
    ProtectedDefault {
        /// Entity identifier.
        id: String,
    },

    /// The entity is busy with an unfinished task.
    #[error("{id} is busy with task {task_id}")]
    InTask {
        /// Entity identifier.
        id: String,
        /// Unfinished task identifier.
        task_id: String,
    },
}

/// Task engine errors.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No procedure is registered under the kind.
    #[error("Unknown task kind: {kind}")]
    UnknownKind {
        /// Task kind.
        kind: String,
    },

    /// The stage is not declared by the task kind.
    #[error("Task kind {kind} has no stage named {stage}")]
    UnknownStage {
        /// Task kind.
        kind: String,
        /// Stage name.
        stage: String,
    },

    /// The task does not exist.
    #[error("Task not found: {id}")]
    NotFound {
        /// Task identifier.
        id: String,
    },

    /// Timed out waiting for a terminal outcome.
    #[error("Timed out waiting for task {id} to finish")]
    WaitTimeout {
        /// Task identifier.
        id: String,
    },
}

/// Result type alias for control plane operations.
pub type Result<T> = std::result::Result<T, ControlPlaneError>;

impl ControlPlaneError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Returns the propagation class of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } | Self::Config(_) => ErrorClass::Validation,
            Self::Provider(_) => ErrorClass::Remote,
            Self::Conflict(_) => ErrorClass::Conflict,
            Self::Store(_) | Self::Task(_) | Self::Io(_) | Self::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(
                ProviderError::RateLimited { .. } | ProviderError::NetworkError { .. }
            ) | Self::Store(StoreError::LockFailed { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            Self::Provider(ProviderError::NetworkError { .. }) => Some(5),
            Self::Store(StoreError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StoreError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a rejection carrying the provider's message verbatim.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_displays_verbatim() {
        let err = ControlPlaneError::from(ProviderError::rejected("quota exceeded"));
        assert_eq!(err.to_string(), "quota exceeded");
        assert_eq!(err.class(), ErrorClass::Remote);
    }

    #[test]
    fn test_classification() {
        let conflict = ControlPlaneError::from(ConflictError::ProtectedDefault {
            id: String::from("default"),
        });
        assert_eq!(conflict.class(), ErrorClass::Conflict);

        let store = ControlPlaneError::from(StoreError::backend("disk full"));
        assert_eq!(store.class(), ErrorClass::Internal);

        let invalid = ControlPlaneError::validation("too big", "size_gb");
        assert_eq!(invalid.class(), ErrorClass::Validation);
    }

    #[test]
    fn test_retry_hints() {
        let limited = ControlPlaneError::from(ProviderError::RateLimited {
            retry_after_secs: 7,
        });
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_delay_secs(), Some(7));

        let rejected = ControlPlaneError::from(ProviderError::rejected("nope"));
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.retry_delay_secs(), None);
    }
}
