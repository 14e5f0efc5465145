//! Forward (join) steps.

use super::network::{CNI_CONFIG_PATH, NetworkPlugin, render_cni_config};
use super::{BootstrapMachine, KUBE_PROXY_SERVICE, KUBELET_CLIENT_PEM, KUBELET_SERVICE, NODE_KUBECONFIG};
use crate::error::StepError;
use crate::fingerprint::{REMOTE_PAYLOAD_DIR, VersionTracker};
use chrono::Utc;
use cluster_client::{CsrDecision, HostCommand, KUBELET_CLIENT_USAGES, NodeStatus, new_request_name};
use crds::annotations::{NODE_USER_PREFIX, STATE_ANNOTATION, VERSION_ANNOTATION};
use crds::{BootstrapState, InstanceRecord, Intent};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl BootstrapMachine {
    /// Pin the target configuration; adopt nodes that already run it
    pub(super) async fn begin(&self, record: &mut InstanceRecord) -> Result<(), StepError> {
        let tracker = self.tracker.current();
        let target = tracker.current_fingerprint().to_string();
        record.target_fingerprint = Some(target.clone());
        self.forget_certificate_request(record);

        if record.intent == Intent::Join && self.already_joined(record, &target).await? {
            info!(
                "Instance {}: node {} is already Ready at the current configuration, adopting",
                record.instance_id, record.node_name
            );
            record.fingerprint = Some(target);
            record.clear_errors();
            record.transition(BootstrapState::Ready, Utc::now());
            return Ok(());
        }

        record.transition(BootstrapState::Connecting, Utc::now());
        Ok(())
    }

    async fn already_joined(&self, record: &InstanceRecord, target: &str) -> Result<bool, StepError> {
        if self.membership.get_node_status(&record.node_name).await? != NodeStatus::Ready {
            return Ok(false);
        }
        let version = self
            .membership
            .node_annotation(&record.node_name, VERSION_ANNOTATION)
            .await?;
        Ok(version.as_deref() == Some(target))
    }

    /// Open a fresh session
    pub(super) async fn connect(&self, record: &mut InstanceRecord) -> Result<(), StepError> {
        self.drop_session(&record.instance_id);
        self.session(record)
            .await
            .map_err(|e| self.client_error(record, e))?;
        debug!("Instance {}: connected to {}", record.instance_id, record.address);
        record.transition(BootstrapState::StagingPayload, Utc::now());
        Ok(())
    }

    /// Copy every payload file whose remote checksum differs
    pub(super) async fn stage_payload(&self, record: &mut InstanceRecord) -> Result<(), StepError> {
        let tracker = self.tracker.current();
        record.target_fingerprint = Some(tracker.current_fingerprint().to_string());
        let session = self
            .session(record)
            .await
            .map_err(|e| self.client_error(record, e))?;

        let mut dirs = tracker.manifest().remote_dirs();
        dirs.extend([
            REMOTE_PAYLOAD_DIR.to_string(),
            format!("{REMOTE_PAYLOAD_DIR}\\log"),
            format!("{REMOTE_PAYLOAD_DIR}\\cni\\config"),
        ]);
        dirs.sort();
        dirs.dedup();
        for path in dirs {
            self.run(record, &session, &HostCommand::EnsureDirectory { path })
                .await?;
        }

        let mut copied = 0;
        for file in tracker.manifest().files() {
            let remote = self
                .run(record, &session, &HostCommand::FileHash { path: file.remote_path.clone() })
                .await?;
            if remote.text().eq_ignore_ascii_case(&file.sha256) {
                continue;
            }

            self.transport
                .copy_file(&session, &file.local_path, &file.remote_path)
                .await
                .map_err(|e| self.client_error(record, e))?;
            copied += 1;

            let after = self
                .run(record, &session, &HostCommand::FileHash { path: file.remote_path.clone() })
                .await?;
            if !after.text().eq_ignore_ascii_case(&file.sha256) {
                let message = format!(
                    "checksum mismatch for {} after copy (expected {}, found {:?})",
                    file.remote_path,
                    file.sha256,
                    after.text()
                );
                if record.step_attempts.saturating_add(1) >= self.settings.max_staging_attempts {
                    return Err(StepError::Configuration(format!(
                        "{message}, persisted over {} attempts",
                        self.settings.max_staging_attempts
                    )));
                }
                return Err(StepError::Transient(message));
            }
        }

        info!(
            "Instance {}: payload staged ({} of {} files copied)",
            record.instance_id,
            copied,
            tracker.manifest().files().len()
        );
        record.transition(BootstrapState::ConfiguringNetwork, Utc::now());
        Ok(())
    }

    /// Write the CNI config and start the network plugin
    pub(super) async fn configure_network(&self, record: &mut InstanceRecord) -> Result<(), StepError> {
        let tracker = self.tracker.current();
        if self.restage_if_changed(record, &tracker) {
            return Ok(());
        }
        let plugin = NetworkPlugin::select(tracker.network())?;
        let session = self
            .session(record)
            .await
            .map_err(|e| self.client_error(record, e))?;

        let cni_config = render_cni_config(tracker.network(), record.network_role)?;
        if self
            .ensure_file(record, &session, CNI_CONFIG_PATH, &cni_config)
            .await?
        {
            info!("Instance {}: wrote CNI config", record.instance_id);
        }
        let kubeconfig = self.render_kubeconfig()?;
        self.ensure_file(record, &session, NODE_KUBECONFIG, kubeconfig.as_bytes())
            .await?;

        self.ensure_service_running(
            record,
            &session,
            plugin.service_name(),
            plugin.service_binary(tracker.network(), &record.node_name),
        )
        .await?;

        self.forget_certificate_request(record);
        record.transition(BootstrapState::AwaitingIdentity, Utc::now());
        Ok(())
    }

    /// Wait for the node certificate request to be decided
    pub(super) async fn obtain_identity(&self, record: &mut InstanceRecord) -> Result<(), StepError> {
        // The name goes on the stored record before the request exists, so
        // the gate never has to approve a request the record does not name
        let Some(request_id) = record.certificate_request.clone() else {
            let request_id = new_request_name();
            debug!(
                "Instance {}: reserving certificate request name {}",
                record.instance_id, request_id
            );
            record.certificate_request = Some(request_id);
            return Ok(());
        };

        if !self.ca.owns_request(&request_id) {
            match self.ca.get_status(&request_id).await {
                Err(e) if e.is_not_found() => {
                    self.submit_certificate_request(record, &request_id).await?;
                }
                Err(e) => return Err(e.into()),
                Ok(_) => {
                    // Submitted by someone else, or by an earlier run whose key is gone
                    warn!(
                        "Instance {}: no key held for certificate request {}, reserving a new name",
                        record.instance_id, request_id
                    );
                    record.certificate_request = None;
                }
            }
            return Ok(());
        }

        let timeout = self.settings.identity_timeout;
        let deadline = Instant::now() + timeout;
        let mut backoff = self.settings.poll.start();
        loop {
            match self.ca.get_status(&request_id).await {
                Ok(CsrDecision::Approved) => {
                    info!(
                        "Instance {}: certificate request {} approved",
                        record.instance_id, request_id
                    );
                    record.transition(BootstrapState::ActivatingServices, Utc::now());
                    return Ok(());
                }
                Ok(CsrDecision::Denied) => {
                    self.ca.release_request(&request_id);
                    return Err(StepError::Security(format!(
                        "certificate request {request_id} for node {} was denied",
                        record.node_name
                    )));
                }
                Ok(CsrDecision::Pending) => {}
                Err(e) if e.is_not_found() => {
                    warn!(
                        "Instance {}: certificate request {} disappeared, submitting it again",
                        record.instance_id, request_id
                    );
                    self.ca.release_request(&request_id);
                    self.submit_certificate_request(record, &request_id).await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StepError::Timeout(format!(
                    "certificate request {request_id} not approved within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(backoff.next_backoff().min(deadline - now)).await;
        }
    }

    /// Install the issued identity, start node services and wait for readiness
    pub(super) async fn activate_services(&self, record: &mut InstanceRecord) -> Result<(), StepError> {
        let Some(request_id) = record.certificate_request.clone() else {
            record.transition(BootstrapState::AwaitingIdentity, Utc::now());
            return Ok(());
        };
        let issued = match self.ca.issued_certificate(&request_id).await {
            Ok(Some(issued)) => issued,
            Ok(None) => {
                return Err(StepError::Transient(format!(
                    "certificate for request {request_id} not issued yet"
                )));
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    "Instance {}: identity for request {} is gone, requesting a new one",
                    record.instance_id, request_id
                );
                self.forget_certificate_request(record);
                record.transition(BootstrapState::AwaitingIdentity, Utc::now());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let session = self
            .session(record)
            .await
            .map_err(|e| self.client_error(record, e))?;
        let pem = format!("{}{}", issued.certificate_pem, issued.private_key_pem);
        self.ensure_file(record, &session, KUBELET_CLIENT_PEM, pem.as_bytes())
            .await?;
        self.ca.release_request(&request_id);

        let tracker = self.tracker.current();
        self.ensure_service_running(record, &session, KUBELET_SERVICE, kubelet_command(record))
            .await?;
        self.ensure_service_running(
            record,
            &session,
            KUBE_PROXY_SERVICE,
            kube_proxy_command(record, &tracker),
        )
        .await?;

        self.wait_for_ready(record).await?;

        let fingerprint = record
            .target_fingerprint
            .clone()
            .unwrap_or_else(|| tracker.current_fingerprint().to_string());
        let annotations = BTreeMap::from([
            (VERSION_ANNOTATION.to_string(), fingerprint.clone()),
            (STATE_ANNOTATION.to_string(), BootstrapState::Ready.to_string()),
        ]);
        self.membership
            .annotate_node(&record.node_name, &annotations)
            .await?;

        record.fingerprint = Some(fingerprint);
        record.clear_errors();
        record.transition(BootstrapState::Ready, Utc::now());
        Ok(())
    }

    async fn wait_for_ready(&self, record: &InstanceRecord) -> Result<(), StepError> {
        let timeout = self.settings.ready_timeout;
        let deadline = Instant::now() + timeout;
        let mut backoff = self.settings.poll.start();
        loop {
            let status = self.membership.get_node_status(&record.node_name).await?;
            if status == NodeStatus::Ready {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StepError::Timeout(format!(
                    "node {} not Ready within {}s (last seen {:?})",
                    record.node_name,
                    timeout.as_secs(),
                    status
                )));
            }
            debug!("Instance {}: node {} is {:?}", record.instance_id, record.node_name, status);
            tokio::time::sleep(backoff.next_backoff().min(deadline - now)).await;
        }
    }

    /// Submit the node certificate request the record names
    async fn submit_certificate_request(&self, record: &mut InstanceRecord, request_id: &str) -> Result<(), StepError> {
        let identity = format!("{NODE_USER_PREFIX}{}", record.node_name);
        match self
            .ca
            .submit_request(request_id, &identity, KUBELET_CLIENT_USAGES)
            .await
        {
            Ok(()) => {
                info!(
                    "Instance {}: submitted certificate request {} for {}",
                    record.instance_id, request_id, identity
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                // Not ours to use: the name is dropped and a fresh one reserved
                record.certificate_request = None;
                Err(StepError::Transient(format!(
                    "certificate request name {request_id} is already taken"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the record's certificate request and drop its key material
    pub(super) fn forget_certificate_request(&self, record: &mut InstanceRecord) {
        if let Some(request_id) = record.certificate_request.take() {
            self.ca.release_request(&request_id);
        }
    }

    /// Go back to staging when the configuration changed since it was staged
    fn restage_if_changed(&self, record: &mut InstanceRecord, tracker: &VersionTracker) -> bool {
        if record.target_fingerprint.as_deref() == Some(tracker.current_fingerprint()) {
            return false;
        }
        info!(
            "Instance {}: configuration changed while joining, staging again",
            record.instance_id
        );
        record.transition(BootstrapState::StagingPayload, Utc::now());
        true
    }

    fn render_kubeconfig(&self) -> Result<String, StepError> {
        let kubeconfig = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": "cluster",
                "cluster": {
                    "server": self.api_server_url,
                    "certificate-authority": format!("{REMOTE_PAYLOAD_DIR}\\ca.crt"),
                },
            }],
            "users": [{
                "name": "kubelet",
                "user": {
                    "client-certificate": KUBELET_CLIENT_PEM,
                    "client-key": KUBELET_CLIENT_PEM,
                },
            }],
            "contexts": [{
                "name": "kubelet",
                "context": { "cluster": "cluster", "user": "kubelet" },
            }],
            "current-context": "kubelet",
        });
        serde_yaml::to_string(&kubeconfig)
            .map_err(|e| StepError::Configuration(format!("cannot render kubeconfig: {e}")))
    }
}

fn kubelet_command(record: &InstanceRecord) -> String {
    format!(
        "{dir}\\kubelet.exe --windows-service --hostname-override={node} --node-ip={address} --kubeconfig={dir}\\kubeconfig --cert-dir={dir} --cgroups-per-qos=false --register-with-taints=os=Windows:NoSchedule --log-file={dir}\\log\\kubelet.log --logtostderr=false",
        dir = REMOTE_PAYLOAD_DIR,
        node = record.node_name,
        address = record.address,
    )
}

fn kube_proxy_command(record: &InstanceRecord, tracker: &VersionTracker) -> String {
    format!(
        "{dir}\\kube-proxy.exe --windows-service --proxy-mode=kernelspace --feature-gates=WinOverlay=true --hostname-override={node} --kubeconfig={dir}\\kubeconfig --cluster-cidr={cidr} --network-name=OVNKubernetesHybridOverlayNetwork --log-file={dir}\\log\\kube-proxy.log --logtostderr=false",
        dir = REMOTE_PAYLOAD_DIR,
        node = record.node_name,
        cidr = tracker.network().cluster_cidr,
    )
}
