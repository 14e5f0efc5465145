//! Collaborator traits
//!
//! The operator only talks to instances and to the cluster through these
//! traits, so that every collaborator can be replaced by a test double.
//! All async methods must be `Send` to work with Tokio's work-stealing runtime.

use crate::error::ClientError;
use crate::models::*;
use std::collections::BTreeMap;
use std::path::Path;

/// Remote command execution and file copy on an instance
///
/// Implementations must report an unreachable instance as
/// [`ClientError::Connection`], distinct from a command that ran and failed.
#[async_trait::async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Open a session to `address`
    async fn connect(&self, address: &str, credentials: &Credentials) -> Result<Session, ClientError>;

    /// Copy the local file `src` to `dst` on the instance
    async fn copy_file(&self, session: &Session, src: &Path, dst: &str) -> Result<(), ClientError>;

    /// Run `command` on the instance and capture its output
    async fn run_command(&self, session: &Session, command: &str) -> Result<CommandOutput, ClientError>;
}

/// Certificate signing request API
#[async_trait::async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Submit a request named `request_id` for `identity` with the given usages
    ///
    /// A request of that name that already exists is reported as
    /// [`ClientError::Conflict`] and is never taken over.
    async fn submit_request(&self, request_id: &str, identity: &str, usages: &[&str]) -> Result<(), ClientError>;

    /// Current decision on a request
    async fn get_status(&self, request_id: &str) -> Result<CsrDecision, ClientError>;

    /// Approve a pending request
    async fn approve(&self, request_id: &str) -> Result<(), ClientError>;

    /// Deny a pending request
    async fn deny(&self, request_id: &str, reason: &str) -> Result<(), ClientError>;

    /// Certificate and key for an approved request, `None` until the certificate is issued
    async fn issued_certificate(&self, request_id: &str) -> Result<Option<IssuedIdentity>, ClientError>;

    /// All requests still awaiting a decision
    async fn pending_requests(&self) -> Result<Vec<CertificateRequest>, ClientError>;

    /// Whether this authority submitted the request and still holds its key
    fn owns_request(&self, request_id: &str) -> bool;

    /// Drop any key material held for a request (no-op if none)
    fn release_request(&self, request_id: &str);
}

/// Cluster membership (node objects)
#[async_trait::async_trait]
pub trait ClusterMembership: Send + Sync {
    /// Readiness of the named node
    async fn get_node_status(&self, node_name: &str) -> Result<NodeStatus, ClientError>;

    /// Value of one annotation on the named node, `None` if the node or annotation is absent
    async fn node_annotation(&self, node_name: &str, key: &str) -> Result<Option<String>, ClientError>;

    /// Merge annotations into the named node
    async fn annotate_node(&self, node_name: &str, annotations: &BTreeMap<String, String>) -> Result<(), ClientError>;

    /// Mark the named node unschedulable (no-op if absent)
    async fn cordon_node(&self, node_name: &str) -> Result<(), ClientError>;

    /// Delete the named node object (no-op if absent)
    async fn remove_node(&self, node_name: &str) -> Result<(), ClientError>;
}

/// Lifecycle of the machine backing an instance
#[async_trait::async_trait]
pub trait InstanceLifecycle: Send + Sync {
    /// Release the machine
    ///
    /// Called while the instance record is still stored at `Removed`, and
    /// called again on a later pass if it fails, so it must be idempotent.
    async fn terminate(&self, instance_id: &str, provider_id: Option<&str>) -> Result<(), ClientError>;
}
