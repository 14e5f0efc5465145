//! Reverse (teardown) path.

use super::network::{CNI_CONFIG_PATH, NetworkPlugin};
use super::{BootstrapMachine, KUBE_PROXY_SERVICE, KUBELET_CLIENT_PEM, KUBELET_SERVICE};
use crate::error::StepError;
use chrono::Utc;
use cluster_client::{HostCommand, Session};
use crds::annotations::STATE_ANNOTATION;
use crds::{BootstrapState, InstanceRecord, Intent};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

impl BootstrapMachine {
    /// Cordon the node, clean up the host and remove the node object
    pub(super) async fn deconfigure(&self, record: &mut InstanceRecord) -> Result<(), StepError> {
        self.membership.cordon_node(&record.node_name).await?;
        let annotations = BTreeMap::from([(
            STATE_ANNOTATION.to_string(),
            BootstrapState::Deconfiguring.to_string(),
        )]);
        if let Err(e) = self
            .membership
            .annotate_node(&record.node_name, &annotations)
            .await
        {
            debug!("Instance {}: not annotating node: {}", record.instance_id, e);
        }

        match self.session(record).await {
            Ok(session) => self.clean_host(record, &session).await?,
            Err(e)
                if e.is_connection()
                    && record.intent == Intent::Remove
                    && record.step_attempts.saturating_add(1) >= self.settings.max_connect_attempts =>
            {
                warn!(
                    "Instance {}: unreachable after {} attempts, removing without host cleanup: {}",
                    record.instance_id,
                    record.step_attempts.saturating_add(1),
                    e
                );
            }
            Err(e) => return Err(self.client_error(record, e)),
        }

        self.membership.remove_node(&record.node_name).await?;
        self.drop_session(&record.instance_id);
        self.forget_certificate_request(record);
        record.transition(BootstrapState::Removed, Utc::now());
        info!("Instance {}: deconfigured", record.instance_id);
        Ok(())
    }

    async fn clean_host(&self, record: &InstanceRecord, session: &Session) -> Result<(), StepError> {
        let services = [
            KUBE_PROXY_SERVICE,
            KUBELET_SERVICE,
            NetworkPlugin::HybridOverlay.service_name(),
        ];
        for name in services {
            let status = self
                .run(record, session, &HostCommand::ServiceStatus { name: name.to_string() })
                .await?;
            if status.text() == "Running" {
                self.run(record, session, &HostCommand::StopService { name: name.to_string() })
                    .await?;
                debug!("Instance {}: stopped service {}", record.instance_id, name);
            }
        }

        for path in [CNI_CONFIG_PATH, KUBELET_CLIENT_PEM] {
            let present = self
                .run(record, session, &HostCommand::FileHash { path: path.to_string() })
                .await?;
            if !present.text().is_empty() {
                self.run(record, session, &HostCommand::RemoveFile { path: path.to_string() })
                    .await?;
            }
        }
        Ok(())
    }
}
