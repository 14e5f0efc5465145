//! Collaborator client errors

use thiserror::Error;

/// Errors that can occur when talking to an instance or to the cluster
#[derive(Debug, Error)]
pub enum ClientError {
    /// The instance could not be reached (session refused, timed out, dropped)
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The instance was reached but the command did not succeed
    #[error("Remote command failed: {0}")]
    Command(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A resource with the requested name already exists
    #[error("Already exists: {0}")]
    Conflict(String),

    /// Key or CSR generation/parsing failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Local IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid request (e.g., malformed identity)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// Whether the error means the instance itself was unreachable
    pub fn is_connection(&self) -> bool {
        matches!(self, ClientError::Connection(_))
    }

    /// Whether the error means the requested name is already taken
    pub fn is_conflict(&self) -> bool {
        match self {
            ClientError::Conflict(_) => true,
            ClientError::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Whether the error is a 404 from the cluster API
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound(_) => true,
            ClientError::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}
