//! Controller-specific error types.
//!
//! `ControllerError` covers operator-level failures (API access, configuration,
//! watches). `StepError` classifies the outcome of a single bootstrap step and
//! decides whether the instance is retried or stopped.

use cluster_client::ClientError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the WinOps controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Collaborator (transport, CA, membership, lifecycle) error
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Payload directory could not be read
    #[error("Payload error: {0}")]
    Payload(String),

    /// Instance record could not be read or written
    #[error("Record store error: {0}")]
    Store(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome classification of a failed bootstrap step
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Retry the step with backoff; bounded, then `Failed` (retryable)
    #[error("{0}")]
    Transient(String),

    /// Waited past the step's deadline; `Failed` (retryable)
    #[error("timed out: {0}")]
    Timeout(String),

    /// Needs a configuration change; `Failed` (non-retryable)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Trust was refused; `Failed` (non-retryable)
    #[error("security error: {0}")]
    Security(String),
}

impl From<ClientError> for StepError {
    fn from(error: ClientError) -> Self {
        StepError::Transient(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_transient() {
        let err: StepError = ClientError::Connection("10.0.0.5: connection refused".to_string()).into();
        assert!(matches!(err, StepError::Transient(_)));
        assert!(err.to_string().contains("connection refused"));
    }
}
