//! WindowsInstance CRD
//!
//! Declares a Windows machine that should be joined to the cluster. The
//! object name is the stable instance identifier; the status holds the
//! operator's record of the instance's bootstrap progress.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "winops.microscaler.io",
    version = "v1alpha1",
    kind = "WindowsInstance",
    namespaced,
    status = "InstanceRecord",
    shortname = "wini",
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.address"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Errors","type":"integer","jsonPath":".status.errorCount"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WindowsInstanceSpec {
    /// IP address or DNS name the operator connects to
    pub address: String,

    /// User the operator logs in as
    #[serde(default = "default_username")]
    pub username: String,

    /// Cloud provider identity of the backing machine (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Node name the instance registers as (defaults to the lower-cased object name)
    ///
    /// A change takes effect by reconfiguring the instance once it is `Ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Pod network attachment for this instance
    ///
    /// A change takes effect by reconfiguring the instance once it is `Ready`.
    #[serde(default)]
    pub network_role: NetworkRole,
}

impl WindowsInstanceSpec {
    /// Node name `instance_id` registers as under this spec
    pub fn node_name_for(&self, instance_id: &str) -> String {
        self.node_name
            .clone()
            .unwrap_or_else(|| instance_id.to_lowercase())
    }
}

fn default_username() -> String {
    "Administrator".to_string()
}

/// How pods on the instance attach to the cluster network
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum NetworkRole {
    /// VXLAN overlay shared with the Linux nodes
    #[default]
    Overlay,

    /// L2 bridge on the host network
    L2Bridge,
}

impl NetworkRole {
    /// Name of the CNI plugin binary implementing this role
    pub fn cni_plugin(&self) -> &'static str {
        match self {
            NetworkRole::Overlay => "win-overlay",
            NetworkRole::L2Bridge => "win-bridge",
        }
    }
}

/// Bootstrap state of one instance
///
/// Serializes as PascalCase ("Ready", "AwaitingIdentity", ...) to match the CRD schema.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum BootstrapState {
    /// Known to the operator, nothing done yet
    #[default]
    Unconfigured,

    /// Opening a remote session
    Connecting,

    /// Copying node binaries and config templates
    StagingPayload,

    /// Writing host network config and starting the overlay component
    ConfiguringNetwork,

    /// Waiting for the node certificate to be approved
    AwaitingIdentity,

    /// Starting kubelet and proxy, waiting for the node to report Ready
    ActivatingServices,

    /// Joined and schedulable
    Ready,

    /// Stopped after an error; see `lastError` and `nonRetryable`
    Failed,

    /// Tearing down services and network config
    Deconfiguring,

    /// Fully torn down
    Removed,
}

impl BootstrapState {
    /// States that only change when the controller dispatches new work
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            BootstrapState::Ready | BootstrapState::Failed | BootstrapState::Removed
        )
    }

    /// PascalCase name, as stored in status and node annotations
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapState::Unconfigured => "Unconfigured",
            BootstrapState::Connecting => "Connecting",
            BootstrapState::StagingPayload => "StagingPayload",
            BootstrapState::ConfiguringNetwork => "ConfiguringNetwork",
            BootstrapState::AwaitingIdentity => "AwaitingIdentity",
            BootstrapState::ActivatingServices => "ActivatingServices",
            BootstrapState::Ready => "Ready",
            BootstrapState::Failed => "Failed",
            BootstrapState::Deconfiguring => "Deconfiguring",
            BootstrapState::Removed => "Removed",
        }
    }
}

impl std::fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the instance is being driven through its state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum Intent {
    /// Join the cluster
    #[default]
    Join,

    /// Tear down and join again with the current configuration
    Reconfigure,

    /// Tear down and release the instance
    Remove,
}

/// The operator's record of one instance
///
/// Stored as the status of the `WindowsInstance` it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    /// Stable instance identifier (the `WindowsInstance` name)
    pub instance_id: String,

    /// Address used for remote sessions
    pub address: String,

    /// Remote login user
    pub username: String,

    /// Node name the instance registers as
    pub node_name: String,

    /// Cloud provider identity of the backing machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Pod network attachment
    #[serde(default)]
    pub network_role: NetworkRole,

    /// Current bootstrap state
    pub state: BootstrapState,

    /// What the current run is trying to achieve
    #[serde(default)]
    pub intent: Intent,

    /// Fingerprint recorded on the last successful join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Fingerprint the in-progress join is provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_fingerprint: Option<String>,

    /// Time of the last state change
    pub last_transition: DateTime<Utc>,

    /// Consecutive errors since the last successful transition
    #[serde(default)]
    pub error_count: u32,

    /// Attempts made at the current step
    #[serde(default)]
    pub step_attempts: u32,

    /// Last error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Failure needs operator attention (or a configuration change) before retrying
    #[serde(default)]
    pub non_retryable: bool,

    /// State the failed run was in, resumed on retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<BootstrapState>,

    /// Name of the certificate signing request submitted for this instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_request: Option<String>,
}

impl InstanceRecord {
    /// Fresh record for a newly observed instance
    pub fn new(instance_id: &str, spec: &WindowsInstanceSpec, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            address: spec.address.clone(),
            username: spec.username.clone(),
            node_name: spec.node_name_for(instance_id),
            provider_id: spec.provider_id.clone(),
            network_role: spec.network_role,
            state: BootstrapState::Unconfigured,
            intent: Intent::Join,
            fingerprint: None,
            target_fingerprint: None,
            last_transition: now,
            error_count: 0,
            step_attempts: 0,
            last_error: None,
            non_retryable: false,
            failed_step: None,
            certificate_request: None,
        }
    }

    /// Pick up connection details edited on the spec since the record was made
    ///
    /// Returns whether anything changed. Node name and network role are left
    /// alone: the node still carries the old ones until it is reconfigured.
    pub fn refresh_connection(&mut self, spec: &WindowsInstanceSpec) -> bool {
        let changed = self.address != spec.address
            || self.username != spec.username
            || self.provider_id != spec.provider_id;
        if changed {
            self.address = spec.address.clone();
            self.username = spec.username.clone();
            self.provider_id = spec.provider_id.clone();
        }
        changed
    }

    /// Whether the node was joined with the node name and network role `spec` asks for
    pub fn matches_node_config(&self, spec: &WindowsInstanceSpec) -> bool {
        self.node_name == spec.node_name_for(&self.instance_id) && self.network_role == spec.network_role
    }

    /// Take every spec-derived field from `spec`, for a fresh join
    pub fn apply_spec(&mut self, spec: &WindowsInstanceSpec) {
        self.refresh_connection(spec);
        self.node_name = spec.node_name_for(&self.instance_id);
        self.network_role = spec.network_role;
    }

    /// Move to `state`, clearing per-step bookkeeping
    pub fn transition(&mut self, state: BootstrapState, now: DateTime<Utc>) {
        self.state = state;
        self.last_transition = now;
        self.step_attempts = 0;
    }

    /// Record a step error without changing state
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.error_count = self.error_count.saturating_add(1);
        self.step_attempts = self.step_attempts.saturating_add(1);
        self.last_error = Some(error.into());
    }

    /// Stop in `Failed`, remembering where to resume
    pub fn fail(&mut self, error: impl Into<String>, non_retryable: bool, now: DateTime<Utc>) {
        let step = self.state;
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.non_retryable = non_retryable;
        self.failed_step = Some(step);
        self.transition(BootstrapState::Failed, now);
    }

    /// Clear error bookkeeping after a successful join
    pub fn clear_errors(&mut self) {
        self.error_count = 0;
        self.last_error = None;
        self.non_retryable = false;
        self.failed_step = None;
    }
}
