//! Certificate approval gate.
//!
//! Decides pending node certificate requests. A request is approved only when
//! it asks for a node identity with node-only groups and kubelet usages, an
//! instance record waiting for that identity names it, and the operator holds
//! its key. Everything else is denied. Each request is decided at most once; requests are remembered only
//! until they are seen decided.

use crate::error::ControllerError;
use crate::store::InstanceStore;
use cluster_client::{
    CertificateAuthority, CertificateRequest, CsrDecision, USAGE_CLIENT_AUTH, USAGE_DIGITAL_SIGNATURE,
    USAGE_KEY_ENCIPHERMENT, USAGE_SERVER_AUTH,
};
use crds::annotations::{AUTHENTICATED_GROUP, NODE_USER_PREFIX, NODES_GROUP};
use crds::{BootstrapState, InstanceRecord};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const ALLOWED_GROUPS: &[&str] = &[NODES_GROUP, AUTHENTICATED_GROUP];
const ALLOWED_USAGES: &[&str] = &[
    USAGE_DIGITAL_SIGNATURE,
    USAGE_KEY_ENCIPHERMENT,
    USAGE_CLIENT_AUTH,
    USAGE_SERVER_AUTH,
];

/// Outcome of the approval policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Issue the certificate
    Approved,
    /// Refuse, with the reason
    Denied(String),
}

/// Apply the approval policy to one request
pub fn decide(request: &CertificateRequest, records: &[InstanceRecord]) -> Decision {
    let Some(node_name) = request.identity.strip_prefix(NODE_USER_PREFIX) else {
        return Decision::Denied(format!("identity {:?} is not a node identity", request.identity));
    };
    if node_name.is_empty() {
        return Decision::Denied("identity names no node".to_string());
    }

    if !request.groups.iter().any(|g| g == NODES_GROUP) {
        return Decision::Denied(format!("groups {:?} do not include {NODES_GROUP}", request.groups));
    }
    if let Some(group) = request.groups.iter().find(|g| !ALLOWED_GROUPS.contains(&g.as_str())) {
        return Decision::Denied(format!("group {group:?} is not allowed for node identities"));
    }

    if request.usages.is_empty() {
        return Decision::Denied("no usages requested".to_string());
    }
    if let Some(usage) = request.usages.iter().find(|u| !ALLOWED_USAGES.contains(&u.as_str())) {
        return Decision::Denied(format!("usage {usage:?} is not allowed"));
    }
    if !request
        .usages
        .iter()
        .any(|u| u == USAGE_CLIENT_AUTH || u == USAGE_SERVER_AUTH)
    {
        return Decision::Denied("neither client auth nor server auth requested".to_string());
    }

    let waiting = records.iter().find(|r| {
        r.state == BootstrapState::AwaitingIdentity
            && r.node_name == node_name
            && r.certificate_request.as_deref() == Some(request.id.as_str())
    });
    match waiting {
        Some(_) => Decision::Approved,
        None => Decision::Denied(format!(
            "no instance awaiting identity for node {node_name} names request {}",
            request.id
        )),
    }
}

/// Watches certificate requests and applies [`decide`]
pub struct ApprovalGate {
    ca: Arc<dyn CertificateAuthority>,
    store: Arc<dyn InstanceStore>,
    decided: Mutex<HashSet<String>>,
}

impl ApprovalGate {
    /// Create a gate
    pub fn new(ca: Arc<dyn CertificateAuthority>, store: Arc<dyn InstanceStore>) -> Self {
        Self {
            ca,
            store,
            decided: Mutex::new(HashSet::new()),
        }
    }

    /// Decide one request, unless it was already decided
    ///
    /// Returns the decision applied, or `None` when the request was skipped.
    pub async fn handle(&self, request: &CertificateRequest) -> Result<Option<Decision>, ControllerError> {
        if request.decision != CsrDecision::Pending {
            self.release(&request.id);
            return Ok(None);
        }
        if !self.claim(&request.id) {
            debug!("CSR {} already decided, skipping", request.id);
            return Ok(None);
        }

        let result = self.apply(request).await;
        if result.is_err() {
            // Not decided after all; the next event retries it
            self.release(&request.id);
        }
        result.map(Some)
    }

    async fn apply(&self, request: &CertificateRequest) -> Result<Decision, ControllerError> {
        let records = self.store.list_records().await?;
        let decision = if self.ca.owns_request(&request.id) {
            decide(request, &records)
        } else {
            Decision::Denied(format!("request {} was not submitted by the operator", request.id))
        };
        match &decision {
            Decision::Approved => {
                self.ca.approve(&request.id).await?;
                info!(
                    "Approved CSR {} for {} (requested by {})",
                    request.id, request.identity, request.requester
                );
            }
            Decision::Denied(reason) => {
                self.ca.deny(&request.id, reason).await?;
                warn!(
                    "Denied CSR {} for {} (requested by {}): {}",
                    request.id, request.identity, request.requester, reason
                );
            }
        }
        Ok(decision)
    }

    /// Decide every pending request; returns how many were decided
    pub async fn process_pending(&self) -> Result<usize, ControllerError> {
        let pending = self.ca.pending_requests().await?;
        {
            let still_pending: HashSet<&str> = pending.iter().map(|r| r.id.as_str()).collect();
            self.decided
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|id| still_pending.contains(id.as_str()));
        }
        let mut decided = 0;
        for request in pending {
            if self.handle(&request).await?.is_some() {
                decided += 1;
            }
        }
        Ok(decided)
    }

    /// Poll for pending requests until the task is dropped
    pub async fn run(&self, interval: Duration) {
        loop {
            if let Err(e) = self.process_pending().await {
                warn!("Certificate approval pass failed: {}", e);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Mark `id` as decided; false if it already was
    fn claim(&self, id: &str) -> bool {
        self.decided
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string())
    }

    fn release(&self, id: &str) {
        self.decided
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Number of requests currently remembered as decided
    #[cfg(test)]
    pub(crate) fn remembered(&self) -> usize {
        self.decided
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
