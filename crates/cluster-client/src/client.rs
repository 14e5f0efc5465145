//! Kubernetes-backed collaborator implementations
//!
//! - [`KubeCertificateAuthority`]: `certificates.k8s.io/v1` CertificateSigningRequests
//! - [`KubeClusterMembership`]: core/v1 Nodes
//! - [`MachineLifecycle`]: `machine.openshift.io/v1beta1` Machines (dynamic API)

use crate::cluster_trait::{CertificateAuthority, ClusterMembership, InstanceLifecycle};
use crate::error::ClientError;
use crate::models::*;
use chrono::{DateTime, Utc};
use crds::annotations::{KUBELET_CLIENT_SIGNER, NODES_GROUP};
use k8s_openapi::ByteString;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestSpec};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::{Api, Client};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, DnValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Field manager used for every patch the operator makes
const FIELD_MANAGER: &str = "winops-controller";

/// Decision carried by the conditions of a CSR
pub fn csr_decision(csr: &CertificateSigningRequest) -> CsrDecision {
    let conditions = csr
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref());
    let Some(conditions) = conditions else {
        return CsrDecision::Pending;
    };
    let is_true = |kind: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == kind && c.status == "True")
    };
    if is_true("Denied") || is_true("Failed") {
        CsrDecision::Denied
    } else if is_true("Approved") {
        CsrDecision::Approved
    } else {
        CsrDecision::Pending
    }
}

fn dn_text(value: &DnValue) -> Option<String> {
    match value {
        DnValue::Utf8String(s) | DnValue::PrintableString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Convert a CSR object into the approval gate's view of it
///
/// The identity and groups come from the PEM encoded request itself, not from
/// anything the submitter could set on the object's metadata.
pub fn certificate_request_from_csr(csr: &CertificateSigningRequest) -> Result<CertificateRequest, ClientError> {
    let id = csr
        .metadata
        .name
        .clone()
        .ok_or_else(|| ClientError::InvalidRequest("CSR missing name".to_string()))?;
    let pem = std::str::from_utf8(&csr.spec.request.0)
        .map_err(|e| ClientError::Certificate(format!("CSR {id} is not PEM text: {e}")))?;
    let parsed = rcgen::CertificateSigningRequest::from_pem(pem)
        .map_err(|e| ClientError::Certificate(format!("CSR {id} could not be parsed: {e}")))?;

    let mut identity = String::new();
    let mut groups = Vec::new();
    for (kind, value) in parsed.params.distinguished_name.iter() {
        match kind {
            DnType::CommonName => identity = dn_text(value).unwrap_or_default(),
            DnType::OrganizationName => groups.extend(dn_text(value)),
            _ => {}
        }
    }

    let submitted_at = csr
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| serde_json::to_value(t).ok())
        .and_then(|v| v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(CertificateRequest {
        id,
        requester: csr.spec.username.clone().unwrap_or_default(),
        identity,
        groups,
        usages: csr.spec.usages.clone().unwrap_or_default(),
        submitted_at,
        decision: csr_decision(csr),
    })
}

/// Private keys of submitted requests, by request name
#[derive(Clone, Default)]
struct PendingKeys(Arc<Mutex<HashMap<String, String>>>);

impl PendingKeys {
    fn insert(&self, request_id: &str, key_pem: String) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.to_string(), key_pem);
    }

    fn get(&self, request_id: &str) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(request_id)
            .cloned()
    }

    fn remove(&self, request_id: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request_id)
            .is_some()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// CertificateSigningRequest based certificate authority
///
/// Keys are generated locally; the private key never leaves the operator
/// until it is written to the instance together with the issued certificate,
/// and is dropped once [`CertificateAuthority::release_request`] is called.
#[derive(Clone)]
pub struct KubeCertificateAuthority {
    api: Api<CertificateSigningRequest>,
    keys: PendingKeys,
}

impl KubeCertificateAuthority {
    /// Create an authority client using the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
            keys: PendingKeys::default(),
        }
    }

    async fn set_condition(&self, request_id: &str, kind: &str, reason: &str, message: &str) -> Result<(), ClientError> {
        let patch = serde_json::json!({
            "status": {
                "conditions": [{
                    "type": kind,
                    "status": "True",
                    "reason": reason,
                    "message": message,
                    "lastUpdateTime": Utc::now().to_rfc3339(),
                }]
            }
        });
        let pp = PatchParams::apply(FIELD_MANAGER);
        self.api
            .patch_approval(request_id, &pp, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CertificateAuthority for KubeCertificateAuthority {
    async fn submit_request(&self, request_id: &str, identity: &str, usages: &[&str]) -> Result<(), ClientError> {
        let mut params = CertificateParams::new(Vec::<String>::new());
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, identity);
        dn.push(DnType::OrganizationName, NODES_GROUP);
        params.distinguished_name = dn;

        let key_and_request = Certificate::from_params(params)
            .map_err(|e| ClientError::Certificate(e.to_string()))?;
        let request_pem = key_and_request
            .serialize_request_pem()
            .map_err(|e| ClientError::Certificate(e.to_string()))?;

        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(request_id.to_string()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request_pem.into_bytes()),
                signer_name: KUBELET_CLIENT_SIGNER.to_string(),
                usages: Some(usages.iter().map(|u| (*u).to_string()).collect()),
                ..Default::default()
            },
            status: None,
        };
        match self.api.create(&PostParams::default(), &csr).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                return Err(ClientError::Conflict(format!("CSR {request_id}")));
            }
            Err(e) => return Err(e.into()),
        }

        self.keys
            .insert(request_id, key_and_request.serialize_private_key_pem());
        info!("Submitted certificate signing request {} for {}", request_id, identity);
        Ok(())
    }

    async fn get_status(&self, request_id: &str) -> Result<CsrDecision, ClientError> {
        let csr = self.api.get(request_id).await?;
        Ok(csr_decision(&csr))
    }

    async fn approve(&self, request_id: &str) -> Result<(), ClientError> {
        self.set_condition(
            request_id,
            "Approved",
            "WinOpsApproved",
            "node identity matches a bootstrapping Windows instance",
        )
        .await
    }

    async fn deny(&self, request_id: &str, reason: &str) -> Result<(), ClientError> {
        self.set_condition(request_id, "Denied", "WinOpsDenied", reason).await
    }

    async fn issued_certificate(&self, request_id: &str) -> Result<Option<IssuedIdentity>, ClientError> {
        let csr = self.api.get(request_id).await?;
        let Some(certificate) = csr.status.and_then(|s| s.certificate) else {
            return Ok(None);
        };
        let private_key_pem = self
            .keys
            .get(request_id)
            .ok_or_else(|| ClientError::NotFound(format!("private key for {request_id}")))?;
        let certificate_pem = String::from_utf8(certificate.0)
            .map_err(|e| ClientError::Certificate(format!("issued certificate is not PEM text: {e}")))?;
        Ok(Some(IssuedIdentity {
            certificate_pem,
            private_key_pem,
        }))
    }

    async fn pending_requests(&self) -> Result<Vec<CertificateRequest>, ClientError> {
        let list = self.api.list(&ListParams::default()).await?;
        let mut pending = Vec::new();
        // Only node client certificates are the operator's to decide
        let candidates = list
            .items
            .iter()
            .filter(|c| c.spec.signer_name == KUBELET_CLIENT_SIGNER)
            .filter(|c| csr_decision(c) == CsrDecision::Pending);
        for csr in candidates {
            match certificate_request_from_csr(csr) {
                Ok(request) => pending.push(request),
                Err(e) => warn!("Skipping unparseable CSR: {}", e),
            }
        }
        Ok(pending)
    }

    fn owns_request(&self, request_id: &str) -> bool {
        self.keys.get(request_id).is_some()
    }

    fn release_request(&self, request_id: &str) {
        if self.keys.remove(request_id) {
            debug!("Dropped private key for {}", request_id);
        }
    }
}

/// Node based cluster membership
#[derive(Clone)]
pub struct KubeClusterMembership {
    api: Api<Node>,
}

impl KubeClusterMembership {
    /// Create a membership client using the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait::async_trait]
impl ClusterMembership for KubeClusterMembership {
    async fn get_node_status(&self, node_name: &str) -> Result<NodeStatus, ClientError> {
        let Some(node) = self.api.get_opt(node_name).await? else {
            return Ok(NodeStatus::Absent);
        };
        let ready = node
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True");
        Ok(if ready { NodeStatus::Ready } else { NodeStatus::NotReady })
    }

    async fn node_annotation(&self, node_name: &str, key: &str) -> Result<Option<String>, ClientError> {
        Ok(self
            .api
            .get_opt(node_name)
            .await?
            .and_then(|n| n.metadata.annotations)
            .and_then(|mut a| a.remove(key)))
    }

    async fn annotate_node(&self, node_name: &str, annotations: &BTreeMap<String, String>) -> Result<(), ClientError> {
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.api
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Annotated node {} with {:?}", node_name, annotations);
        Ok(())
    }

    async fn cordon_node(&self, node_name: &str) -> Result<(), ClientError> {
        let patch = serde_json::json!({ "spec": { "unschedulable": true } });
        match self
            .api
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_node(&self, node_name: &str) -> Result<(), ClientError> {
        match self.api.delete(node_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted node {}", node_name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Releases instances by deleting their `Machine` object
///
/// Instances without a provider identity were not created by a machine set
/// (bring-your-own-host); terminating them is a no-op.
#[derive(Clone)]
pub struct MachineLifecycle {
    api: Api<DynamicObject>,
}

impl MachineLifecycle {
    /// Create a lifecycle client for Machines in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        let gvk = GroupVersionKind::gvk("machine.openshift.io", "v1beta1", "Machine");
        let resource = ApiResource::from_gvk(&gvk);
        Self {
            api: Api::namespaced_with(client, namespace, &resource),
        }
    }
}

#[async_trait::async_trait]
impl InstanceLifecycle for MachineLifecycle {
    async fn terminate(&self, instance_id: &str, provider_id: Option<&str>) -> Result<(), ClientError> {
        let Some(provider_id) = provider_id else {
            info!("Instance {} has no provider identity, leaving the machine in place", instance_id);
            return Ok(());
        };
        let machines = self.api.list(&ListParams::default()).await?;
        let machine = machines.items.into_iter().find(|m| {
            m.data
                .get("spec")
                .and_then(|s| s.get("providerID"))
                .and_then(|v| v.as_str())
                == Some(provider_id)
        });
        let Some(name) = machine.and_then(|m| m.metadata.name) else {
            warn!("No Machine found for instance {} ({}), nothing to terminate", instance_id, provider_id);
            return Ok(());
        };
        match self.api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted Machine {} backing instance {}", name, instance_id);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
