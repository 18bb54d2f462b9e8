//! Error types for the Bastion Kubernetes Operator

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Optimistic-concurrency conflict against the API server
    #[error("Conflict writing {kind}/{name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Conflict retries for one resource exceeded the configured bound
    #[error("Gave up on {resource} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { resource: String, attempts: u32 },

    /// An existing object belongs to another manager
    #[error(
        "resource '{name}' is managed by '{manager}', not bastion-operator; refusing to overwrite"
    )]
    OwnershipConflict { name: String, manager: String },

    /// The object store could not be reached
    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Pass deadline elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Pass was cancelled by the host
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Conflict { .. }
                | OperatorError::StoreUnavailable(_)
                | OperatorError::SerializationError(_)
                | OperatorError::Timeout(_)
                | OperatorError::Cancelled(_)
        )
    }

    /// Whether this is an optimistic-lock conflict the driver can retry quickly
    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict { .. })
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::Conflict { .. } => Some(Duration::from_secs(1)),
            e if e.is_retryable() => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::NotFound {
            kind: "Deployment".to_string(),
            name: "prod-server".to_string(),
            namespace: "default".to_string(),
        };
        assert!(err.to_string().contains("Deployment"));
        assert!(err.to_string().contains("prod-server"));
    }

    #[test]
    fn test_retryable_errors() {
        let timeout_err = OperatorError::Timeout("test".to_string());
        assert!(timeout_err.is_retryable());

        let validation_err = OperatorError::ValidationError("test".to_string());
        assert!(!validation_err.is_retryable());

        let serde_err: OperatorError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert!(serde_err.is_retryable());
    }

    #[test]
    fn test_requeue_delay() {
        let conflict = OperatorError::Conflict {
            kind: "Deployment".to_string(),
            name: "prod-server".to_string(),
            message: "stale resourceVersion".to_string(),
        };
        assert!(conflict.is_conflict());
        assert_eq!(conflict.requeue_delay(), Some(Duration::from_secs(1)));

        let retryable = OperatorError::Timeout("test".to_string());
        assert_eq!(retryable.requeue_delay(), Some(Duration::from_secs(30)));

        let not_retryable = OperatorError::InvalidConfig("test".to_string());
        assert!(not_retryable.requeue_delay().is_none());
    }

    #[test]
    fn test_ownership_conflict_not_retryable() {
        let err = OperatorError::OwnershipConflict {
            name: "prod-server".to_string(),
            manager: "helm".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("helm"));
    }
}
