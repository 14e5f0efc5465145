//! Data types exchanged with collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Key usage: digital signature
pub const USAGE_DIGITAL_SIGNATURE: &str = "digital signature";
/// Key usage: key encipherment
pub const USAGE_KEY_ENCIPHERMENT: &str = "key encipherment";
/// Extended key usage: TLS client authentication
pub const USAGE_CLIENT_AUTH: &str = "client auth";
/// Extended key usage: TLS server authentication
pub const USAGE_SERVER_AUTH: &str = "server auth";

/// Usages requested for a kubelet client certificate
pub const KUBELET_CLIENT_USAGES: &[&str] = &[
    USAGE_DIGITAL_SIGNATURE,
    USAGE_KEY_ENCIPHERMENT,
    USAGE_CLIENT_AUTH,
];

/// Fresh, unguessable name for a certificate signing request
pub fn new_request_name() -> String {
    format!("winops-{}", uuid::Uuid::new_v4().simple())
}

/// Login material for a remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Remote user
    pub username: String,
    /// Private key used for authentication
    pub private_key_path: PathBuf,
}

/// An established remote session with an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Unique session identifier
    pub id: String,
    /// Address the session is connected to
    pub address: String,
    /// Credentials the session was opened with
    pub credentials: Credentials,
}

/// Result of a remote command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }
}

/// Decision on a certificate signing request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum CsrDecision {
    /// Not decided yet
    Pending,
    /// Approved; a certificate will be (or has been) issued
    Approved,
    /// Denied (or failed); no certificate will be issued
    Denied,
}

/// A certificate signing request as seen by the approval gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    /// Request identifier (the CSR object name)
    pub id: String,
    /// User that submitted the request
    pub requester: String,
    /// Identity claimed by the certificate subject (common name)
    pub identity: String,
    /// Groups claimed by the certificate subject (organizations)
    pub groups: Vec<String>,
    /// Requested key usages
    pub usages: Vec<String>,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
    /// Current decision
    pub decision: CsrDecision,
}

/// Certificate and key issued to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedIdentity {
    /// PEM encoded certificate
    pub certificate_pem: String,
    /// PEM encoded private key matching the certificate
    pub private_key_pem: String,
}

/// Readiness of a node as reported by the cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    /// Node registered and Ready
    Ready,
    /// Node registered but not Ready
    NotReady,
    /// No such node
    Absent,
}
