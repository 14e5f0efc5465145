//! Integration tests for the Kubernetes-backed clients
//!
//! These tests require a reachable cluster (KUBECONFIG or in-cluster config)
//! with permission to create CertificateSigningRequests and read Nodes.

use cluster_client::{
    CertificateAuthority, ClusterMembership, CsrDecision, KUBELET_CLIENT_USAGES,
    KubeCertificateAuthority, KubeClusterMembership, NodeStatus, new_request_name,
};

#[tokio::test]
#[ignore] // Requires a running cluster
async fn test_submit_request_starts_pending() {
    let client = kube::Client::try_default()
        .await
        .expect("Failed to create Kubernetes client");
    let ca = KubeCertificateAuthority::new(client);

    let id = new_request_name();
    ca.submit_request(&id, "system:node:winops-integration", KUBELET_CLIENT_USAGES)
        .await
        .expect("Failed to submit CSR");

    let status = ca.get_status(&id).await.expect("Failed to read CSR");
    assert_eq!(status, CsrDecision::Pending);

    let pending = ca.pending_requests().await.expect("Failed to list CSRs");
    let request = pending
        .iter()
        .find(|r| r.id == id)
        .expect("Submitted CSR not listed as pending");
    assert_eq!(request.identity, "system:node:winops-integration");
    assert!(request.groups.iter().any(|g| g == "system:nodes"));

    // The name stays with the first submitter
    let err = ca
        .submit_request(&id, "system:node:winops-integration", KUBELET_CLIENT_USAGES)
        .await
        .expect_err("Resubmitting under a taken name succeeded");
    assert!(err.is_conflict());
    ca.release_request(&id);
}

#[tokio::test]
#[ignore] // Requires a running cluster
async fn test_unknown_node_is_absent() {
    let client = kube::Client::try_default()
        .await
        .expect("Failed to create Kubernetes client");
    let membership = KubeClusterMembership::new(client);

    let status = membership
        .get_node_status("winops-node-that-does-not-exist")
        .await
        .expect("Failed to query node");
    assert_eq!(status, NodeStatus::Absent);

    // Cordoning and removing an absent node are no-ops
    membership
        .cordon_node("winops-node-that-does-not-exist")
        .await
        .expect("Cordon of absent node failed");
    membership
        .remove_node("winops-node-that-does-not-exist")
        .await
        .expect("Removal of absent node failed");
}
