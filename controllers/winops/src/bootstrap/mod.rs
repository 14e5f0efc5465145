//! Per-instance bootstrap state machine.
//!
//! [`BootstrapMachine::advance`] performs one step for one instance and
//! returns the updated record. Every step checks what already holds on the
//! instance or in the cluster before changing it, so repeating a step after
//! a crash or a retry is safe.
//!
//! Forward path: Unconfigured → Connecting → StagingPayload →
//! ConfiguringNetwork → AwaitingIdentity → ActivatingServices → Ready.
//! Reverse path: any state → Deconfiguring → Removed.

mod network;
mod steps;
mod teardown;

pub use network::{CNI_CONFIG_PATH, NetworkPlugin, render_cni_config};

use crate::config::BootstrapSettings;
use crate::error::StepError;
use crate::fingerprint::SharedTracker;
use chrono::Utc;
use cluster_client::{
    CertificateAuthority, ClientError, ClusterMembership, CommandOutput, Credentials, HostCommand,
    RemoteTransport, Session,
};
use crds::{BootstrapState, InstanceRecord, Intent};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Kubelet service name on the instance
pub const KUBELET_SERVICE: &str = "kubelet";
/// Kube-proxy service name on the instance
pub const KUBE_PROXY_SERVICE: &str = "kube-proxy";
/// Combined kubelet client certificate and key
pub const KUBELET_CLIENT_PEM: &str = "C:\\k\\kubelet-client-current.pem";
/// Kubeconfig used by the node services
pub const NODE_KUBECONFIG: &str = "C:\\k\\kubeconfig";

/// Collaborators the state machine drives
#[derive(Clone)]
pub struct Collaborators {
    /// Remote command execution and file copy
    pub transport: Arc<dyn RemoteTransport>,
    /// Node certificate issuance
    pub ca: Arc<dyn CertificateAuthority>,
    /// Node objects
    pub membership: Arc<dyn ClusterMembership>,
}

/// Drives instance records through the bootstrap states
pub struct BootstrapMachine {
    pub(crate) transport: Arc<dyn RemoteTransport>,
    pub(crate) ca: Arc<dyn CertificateAuthority>,
    pub(crate) membership: Arc<dyn ClusterMembership>,
    pub(crate) tracker: SharedTracker,
    pub(crate) private_key_path: PathBuf,
    pub(crate) api_server_url: String,
    pub(crate) settings: BootstrapSettings,
    /// Open sessions per instance id
    sessions: Mutex<HashMap<String, Session>>,
}

impl BootstrapMachine {
    /// Create a state machine
    pub fn new(
        collaborators: Collaborators,
        tracker: SharedTracker,
        private_key_path: PathBuf,
        api_server_url: String,
        settings: BootstrapSettings,
    ) -> Self {
        Self {
            transport: collaborators.transport,
            ca: collaborators.ca,
            membership: collaborators.membership,
            tracker,
            private_key_path,
            api_server_url,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Perform one step for `record`
    ///
    /// `Ready`, `Failed` and `Removed` are left unchanged. Step errors are
    /// recorded on the returned record, never returned.
    pub async fn advance(&self, record: &InstanceRecord) -> InstanceRecord {
        let mut next = record.clone();
        let result = match record.state {
            BootstrapState::Unconfigured => self.begin(&mut next).await,
            BootstrapState::Connecting => self.connect(&mut next).await,
            BootstrapState::StagingPayload => self.stage_payload(&mut next).await,
            BootstrapState::ConfiguringNetwork => self.configure_network(&mut next).await,
            BootstrapState::AwaitingIdentity => self.obtain_identity(&mut next).await,
            BootstrapState::ActivatingServices => self.activate_services(&mut next).await,
            BootstrapState::Deconfiguring => self.deconfigure(&mut next).await,
            BootstrapState::Ready | BootstrapState::Failed | BootstrapState::Removed => Ok(()),
        };
        if let Err(error) = result {
            self.record_failure(&mut next, error);
        }
        if next.state != record.state {
            info!(
                "Instance {}: {} -> {}",
                next.instance_id, record.state, next.state
            );
        }
        next
    }

    /// Start tearing an instance down
    pub fn begin_teardown(&self, record: &InstanceRecord, intent: Intent) -> InstanceRecord {
        let mut next = record.clone();
        next.intent = intent;
        next.non_retryable = false;
        next.failed_step = None;
        next.transition(BootstrapState::Deconfiguring, Utc::now());
        next
    }

    /// Return a failed instance to the step it failed in
    pub fn resume(&self, record: &InstanceRecord) -> InstanceRecord {
        let mut next = record.clone();
        let step = record.failed_step.unwrap_or(BootstrapState::Unconfigured);
        next.non_retryable = false;
        next.failed_step = None;
        // A non-retryable failure is only resumed after a configuration change
        // and goes through the whole join again
        let step = if record.non_retryable {
            BootstrapState::Unconfigured
        } else {
            step
        };
        next.transition(step, Utc::now());
        next
    }

    /// Start joining again after a reconfigure teardown
    pub fn restart(&self, record: &InstanceRecord) -> InstanceRecord {
        let mut next = record.clone();
        next.intent = Intent::Join;
        next.fingerprint = None;
        next.target_fingerprint = None;
        next.certificate_request = None;
        next.transition(BootstrapState::Unconfigured, Utc::now());
        next
    }

    fn record_failure(&self, record: &mut InstanceRecord, error: StepError) {
        let now = Utc::now();
        match error {
            StepError::Transient(message) => {
                let limit = match record.state {
                    BootstrapState::Connecting | BootstrapState::Deconfiguring => {
                        self.settings.max_connect_attempts
                    }
                    _ => self.settings.max_step_attempts,
                };
                let attempts = record.step_attempts.saturating_add(1);
                if attempts >= limit {
                    warn!(
                        "Instance {}: {} failed {} times, giving up: {}",
                        record.instance_id, record.state, attempts, message
                    );
                    record.fail(message, false, now);
                } else {
                    record.record_error(message.clone());
                    debug!(
                        "Instance {}: {} attempt {} failed: {}",
                        record.instance_id, record.state, record.step_attempts, message
                    );
                }
            }
            StepError::Timeout(_) => {
                warn!("Instance {}: {} {}", record.instance_id, record.state, error);
                record.fail(error.to_string(), false, now);
            }
            StepError::Configuration(_) | StepError::Security(_) => {
                warn!("Instance {}: {} {}", record.instance_id, record.state, error);
                record.fail(error.to_string(), true, now);
            }
        }
    }

    pub(crate) fn credentials(&self, record: &InstanceRecord) -> Credentials {
        Credentials {
            username: record.username.clone(),
            private_key_path: self.private_key_path.clone(),
        }
    }

    /// Cached session for the instance, opening one if needed
    pub(crate) async fn session(&self, record: &InstanceRecord) -> Result<Session, ClientError> {
        let credentials = self.credentials(record);
        if let Some(session) = self.cached_session(&record.instance_id) {
            // Address and user may have been edited on the WindowsInstance
            if session.address == record.address && session.credentials == credentials {
                return Ok(session);
            }
            debug!(
                "Instance {}: connection details changed, reconnecting to {}",
                record.instance_id, record.address
            );
        }
        let session = self
            .transport
            .connect(&record.address, &credentials)
            .await?;
        self.lock_sessions()
            .insert(record.instance_id.clone(), session.clone());
        Ok(session)
    }

    fn cached_session(&self, instance_id: &str) -> Option<Session> {
        self.lock_sessions().get(instance_id).cloned()
    }

    pub(crate) fn drop_session(&self, instance_id: &str) {
        self.lock_sessions().remove(instance_id);
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Run a host command; non-zero exit is a transient step error
    pub(crate) async fn run(
        &self,
        record: &InstanceRecord,
        session: &Session,
        command: &HostCommand,
    ) -> Result<CommandOutput, StepError> {
        let output = self
            .transport
            .run_command(session, &command.to_command_line())
            .await
            .map_err(|e| self.client_error(record, e))?;
        if !output.success() {
            return Err(StepError::Transient(format!(
                "{:?} exited with {}: {}",
                command,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Classify a collaborator error, forgetting the session if the instance went away
    pub(crate) fn client_error(&self, record: &InstanceRecord, error: ClientError) -> StepError {
        if error.is_connection() {
            self.drop_session(&record.instance_id);
        }
        StepError::from(error)
    }

    /// Write `contents` to `path` unless the file already holds them
    ///
    /// Returns whether the file was written.
    pub(crate) async fn ensure_file(
        &self,
        record: &InstanceRecord,
        session: &Session,
        path: &str,
        contents: &[u8],
    ) -> Result<bool, StepError> {
        let expected = hex::encode_upper(Sha256::digest(contents));
        let current = self
            .run(record, session, &HostCommand::FileHash { path: path.to_string() })
            .await?;
        if current.text().eq_ignore_ascii_case(&expected) {
            return Ok(false);
        }
        self.run(
            record,
            session,
            &HostCommand::WriteFile {
                path: path.to_string(),
                contents: contents.to_vec(),
            },
        )
        .await?;
        Ok(true)
    }

    /// Install `name` if missing and start it unless already running
    pub(crate) async fn ensure_service_running(
        &self,
        record: &InstanceRecord,
        session: &Session,
        name: &str,
        binary_path: String,
    ) -> Result<(), StepError> {
        let status = self
            .run(record, session, &HostCommand::ServiceStatus { name: name.to_string() })
            .await?;
        match status.text() {
            "Running" => return Ok(()),
            "" => {
                self.run(
                    record,
                    session,
                    &HostCommand::CreateService {
                        name: name.to_string(),
                        binary_path,
                    },
                )
                .await?;
            }
            _ => {}
        }
        self.run(record, session, &HostCommand::StartService { name: name.to_string() })
            .await?;
        info!("Instance {}: started service {}", record.instance_id, name);
        Ok(())
    }
}

#[cfg(test)]
mod bootstrap_test;
