//! Unit tests for the bootstrap state machine

#[cfg(test)]
mod tests {
    use crate::bootstrap::{CNI_CONFIG_PATH, KUBELET_CLIENT_PEM, KUBELET_SERVICE, KUBE_PROXY_SERVICE};
    use crate::fingerprint::{PayloadManifest, VersionTracker};
    use crate::test_utils::*;
    use cluster_client::{CertificateAuthority, NodeStatus};
    use crds::annotations::{STATE_ANNOTATION, VERSION_ANNOTATION};
    use crds::{BootstrapState, InstanceRecord, Intent};
    use std::collections::BTreeMap;

    const ADDRESS: &str = "10.0.0.5";

    fn harness() -> TestHarness {
        let h = TestHarness::new();
        h.transport.add_host(ADDRESS);
        h
    }

    /// Advance until `state` is reached (or 20 steps pass)
    async fn advance_to(h: &TestHarness, mut record: InstanceRecord, state: BootstrapState) -> InstanceRecord {
        for _ in 0..20 {
            if record.state == state {
                return record;
            }
            record = h.machine.advance(&record).await;
        }
        panic!("never reached {state:?}, stuck at {:?}: {:?}", record.state, record.last_error);
    }

    /// Drive a fresh record until its certificate request is submitted
    async fn requested(h: &TestHarness) -> InstanceRecord {
        let record = create_test_record("win-1", ADDRESS);
        let record = advance_to(h, record, BootstrapState::AwaitingIdentity).await;
        assert!(record.certificate_request.is_none());

        // The name is reserved on the record first, then submitted
        let record = h.machine.advance(&record).await;
        assert_eq!(record.state, BootstrapState::AwaitingIdentity);
        assert!(record.certificate_request.is_some());
        assert_eq!(h.cluster.submissions_for("system:node:win-1"), 0);

        let submitted = h.machine.advance(&record).await;
        assert_eq!(submitted, record);
        assert_eq!(h.cluster.submissions_for("system:node:win-1"), 1);
        submitted
    }

    async fn joined(h: &TestHarness) -> InstanceRecord {
        let record = requested(h).await;
        let request = record.certificate_request.clone().unwrap();
        h.cluster.approve(&request).await.unwrap();
        advance_to(h, record, BootstrapState::Ready).await
    }

    #[tokio::test]
    async fn test_advance_on_ready_is_a_no_op() {
        let h = harness();
        let mut record = create_test_record("win-1", ADDRESS);
        record.transition(BootstrapState::Ready, chrono::Utc::now());
        record.fingerprint = Some(h.current_fingerprint());

        let once = h.machine.advance(&record).await;
        let twice = h.machine.advance(&once).await;

        assert_eq!(once, record);
        assert_eq!(twice, record);
        assert_eq!(h.transport.connect_count(ADDRESS), 0);
        assert!(h.transport.commands(ADDRESS).is_empty());
    }

    #[tokio::test]
    async fn test_failed_and_removed_are_left_alone() {
        let h = harness();
        for state in [BootstrapState::Failed, BootstrapState::Removed] {
            let mut record = create_test_record("win-1", ADDRESS);
            record.transition(state, chrono::Utc::now());
            assert_eq!(h.machine.advance(&record).await, record);
        }
        assert!(h.transport.commands(ADDRESS).is_empty());
    }

    #[tokio::test]
    async fn test_forward_path_joins_the_node() {
        let h = harness();
        let record = joined(&h).await;

        assert_eq!(record.fingerprint.as_deref(), Some(h.current_fingerprint().as_str()));
        assert_eq!(record.error_count, 0);
        assert!(h.transport.file(ADDRESS, CNI_CONFIG_PATH).is_some());
        assert!(h.transport.file(ADDRESS, KUBELET_CLIENT_PEM).is_some());
        assert!(h.transport.file(ADDRESS, "C:\\k\\cni\\win-overlay.exe").is_some());
        assert!(h.transport.service_running(ADDRESS, KUBELET_SERVICE));
        assert!(h.transport.service_running(ADDRESS, KUBE_PROXY_SERVICE));
        assert!(h.transport.service_running(ADDRESS, "hybrid-overlay-node"));

        let node = h.cluster.node("win-1").unwrap();
        assert_eq!(node.status, NodeStatus::Ready);
        assert_eq!(node.annotations.get(VERSION_ANNOTATION), record.fingerprint.as_ref());
        assert_eq!(node.annotations.get(STATE_ANNOTATION).map(String::as_str), Some("Ready"));
    }

    #[tokio::test]
    async fn test_connect_attempts_are_bounded() {
        let h = harness();
        h.transport.set_reachable(ADDRESS, false);
        let mut record = create_test_record("win-1", ADDRESS);
        record.transition(BootstrapState::Connecting, chrono::Utc::now());

        record = h.machine.advance(&record).await;
        assert_eq!(record.state, BootstrapState::Connecting);
        assert_eq!(record.error_count, 1);
        record = h.machine.advance(&record).await;
        assert_eq!(record.state, BootstrapState::Connecting);
        record = h.machine.advance(&record).await;

        assert_eq!(record.state, BootstrapState::Failed);
        assert_eq!(record.failed_step, Some(BootstrapState::Connecting));
        assert!(!record.non_retryable);
        assert_eq!(record.error_count, 3);
        assert_eq!(h.transport.connect_count(ADDRESS), 0);
    }

    #[tokio::test]
    async fn test_staging_copies_only_changed_files() {
        let h = harness();
        h.transport
            .put_file(ADDRESS, "C:\\k\\kubelet.exe", b"kubelet v1.30");
        let mut record = create_test_record("win-1", ADDRESS);
        record = advance_to(&h, record, BootstrapState::ConfiguringNetwork).await;
        assert_eq!(h.transport.copy_count(ADDRESS), 3);

        // Staging again finds everything in place
        record.transition(BootstrapState::StagingPayload, chrono::Utc::now());
        let again = h.machine.advance(&record).await;
        assert_eq!(again.state, BootstrapState::ConfiguringNetwork);
        assert_eq!(h.transport.copy_count(ADDRESS), 3);
    }

    #[tokio::test]
    async fn test_persistent_checksum_mismatch_is_fatal() {
        let h = harness();
        h.transport.corrupt_next_copies(ADDRESS, 100);
        let mut record = create_test_record("win-1", ADDRESS);
        record = advance_to(&h, record, BootstrapState::StagingPayload).await;

        record = h.machine.advance(&record).await;
        assert_eq!(record.state, BootstrapState::StagingPayload);
        assert!(record.last_error.as_deref().unwrap().contains("checksum mismatch"));
        record = h.machine.advance(&record).await;
        assert_eq!(record.state, BootstrapState::StagingPayload);
        record = h.machine.advance(&record).await;

        assert_eq!(record.state, BootstrapState::Failed);
        assert!(record.non_retryable);
        assert_eq!(record.failed_step, Some(BootstrapState::StagingPayload));
    }

    #[tokio::test]
    async fn test_unsupported_network_type_is_fatal() {
        let h = harness();
        let mut network = create_test_network();
        network.network_type = "OpenShiftSDN".to_string();
        h.tracker.replace(VersionTracker::new(
            PayloadManifest::from_dir(&h.payload_dir).unwrap(),
            network,
            "1.0.0",
        ));

        let record = create_test_record("win-1", ADDRESS);
        let record = advance_to(&h, record, BootstrapState::Failed).await;

        assert_eq!(record.failed_step, Some(BootstrapState::ConfiguringNetwork));
        assert!(record.non_retryable);
        assert!(record.last_error.unwrap().contains("OpenShiftSDN"));
        assert!(h.transport.file(ADDRESS, CNI_CONFIG_PATH).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_is_requested_once_and_times_out() {
        let h = harness();
        let record = requested(&h).await;
        let request = record.certificate_request.clone().unwrap();

        let failed = h.machine.advance(&record).await;
        assert_eq!(failed.state, BootstrapState::Failed);
        assert!(!failed.non_retryable);
        assert!(failed.last_error.as_deref().unwrap().contains("timed out"));

        // Retrying waits on the same request instead of submitting another
        let resumed = h.machine.resume(&failed);
        assert_eq!(resumed.state, BootstrapState::AwaitingIdentity);
        assert_eq!(resumed.certificate_request.as_deref(), Some(request.as_str()));
        h.cluster.approve(&request).await.unwrap();
        let next = h.machine.advance(&resumed).await;
        assert_eq!(next.state, BootstrapState::ActivatingServices);
        assert_eq!(h.cluster.submissions_for("system:node:win-1"), 1);
    }

    #[tokio::test]
    async fn test_taken_request_name_is_given_up() {
        let h = harness();
        let record = create_test_record("win-1", ADDRESS);
        let record = advance_to(&h, record, BootstrapState::AwaitingIdentity).await;
        let record = h.machine.advance(&record).await;
        let reserved = record.certificate_request.clone().unwrap();

        // Someone else creates a request under the reserved name first
        h.cluster.add_request(cluster_client::CertificateRequest {
            id: reserved.clone(),
            requester: "system:serviceaccount:default:builder".to_string(),
            identity: "system:node:win-1".to_string(),
            groups: vec!["system:nodes".to_string()],
            usages: vec!["client auth".to_string()],
            submitted_at: chrono::Utc::now(),
            decision: cluster_client::CsrDecision::Pending,
        });

        let record = h.machine.advance(&record).await;
        assert_eq!(record.state, BootstrapState::AwaitingIdentity);
        assert_eq!(record.certificate_request, None);
        assert!(!h.cluster.owns_request(&reserved));

        let record = h.machine.advance(&record).await;
        let fresh = record.certificate_request.clone().unwrap();
        assert_ne!(fresh, reserved);
        let record = h.machine.advance(&record).await;
        assert!(h.cluster.owns_request(&fresh));
        assert_eq!(record.certificate_request.as_deref(), Some(fresh.as_str()));
    }

    #[tokio::test]
    async fn test_key_is_released_once_installed() {
        let h = harness();
        let record = requested(&h).await;
        let request = record.certificate_request.clone().unwrap();
        h.cluster.approve(&request).await.unwrap();
        assert!(h.cluster.released().is_empty());

        let record = advance_to(&h, record, BootstrapState::Ready).await;
        assert_eq!(h.cluster.released(), vec![request]);
        assert!(h.transport.file(ADDRESS, KUBELET_CLIENT_PEM).is_some());
        assert_eq!(record.state, BootstrapState::Ready);
    }

    #[tokio::test]
    async fn test_denied_identity_is_fatal() {
        let h = harness();
        let record = requested(&h).await;
        let request = record.certificate_request.clone().unwrap();
        h.cluster.deny(&request, "test").await.unwrap();

        let record = h.machine.advance(&record).await;
        assert_eq!(record.state, BootstrapState::Failed);
        assert!(record.non_retryable);
        assert_eq!(record.failed_step, Some(BootstrapState::AwaitingIdentity));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_that_never_becomes_ready_fails_retryably() {
        let h = harness();
        h.cluster.hold_not_ready("win-1");
        let record = requested(&h).await;
        h.cluster
            .approve(record.certificate_request.as_deref().unwrap())
            .await
            .unwrap();
        let record = advance_to(&h, record, BootstrapState::ActivatingServices).await;

        let record = h.machine.advance(&record).await;
        assert_eq!(record.state, BootstrapState::Failed);
        assert_eq!(record.failed_step, Some(BootstrapState::ActivatingServices));
        assert!(!record.non_retryable);
        assert!(record.fingerprint.is_none());
    }

    #[tokio::test]
    async fn test_ready_node_with_current_version_is_adopted() {
        let h = harness();
        h.cluster.add_node(
            "win-1",
            NodeStatus::Ready,
            BTreeMap::from([(VERSION_ANNOTATION.to_string(), h.current_fingerprint())]),
        );

        let record = h.machine.advance(&create_test_record("win-1", ADDRESS)).await;

        assert_eq!(record.state, BootstrapState::Ready);
        assert_eq!(record.fingerprint, Some(h.current_fingerprint()));
        assert_eq!(h.transport.connect_count(ADDRESS), 0);
    }

    #[tokio::test]
    async fn test_ready_node_with_old_version_is_not_adopted() {
        let h = harness();
        h.cluster.add_node(
            "win-1",
            NodeStatus::Ready,
            BTreeMap::from([(VERSION_ANNOTATION.to_string(), "0".repeat(64))]),
        );

        let record = h.machine.advance(&create_test_record("win-1", ADDRESS)).await;
        assert_eq!(record.state, BootstrapState::Connecting);
    }

    #[tokio::test]
    async fn test_deconfigure_cleans_up_host_and_node() {
        let h = harness();
        let record = joined(&h).await;

        let record = h.machine.begin_teardown(&record, Intent::Remove);
        let record = h.machine.advance(&record).await;

        assert_eq!(record.state, BootstrapState::Removed);
        assert!(h.cluster.node("win-1").is_none());
        assert!(!h.transport.service_running(ADDRESS, KUBELET_SERVICE));
        assert!(!h.transport.service_running(ADDRESS, "hybrid-overlay-node"));
        assert!(h.transport.file(ADDRESS, CNI_CONFIG_PATH).is_none());
        assert!(h.transport.file(ADDRESS, KUBELET_CLIENT_PEM).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_still_removed() {
        let h = harness();
        let record = joined(&h).await;
        h.transport.set_reachable(ADDRESS, false);

        let record = h.machine.begin_teardown(&record, Intent::Remove);
        let record = advance_to(&h, record, BootstrapState::Removed).await;

        assert_eq!(record.intent, Intent::Remove);
        assert!(h.cluster.node("win-1").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_instance_fails_reconfigure() {
        let h = harness();
        let record = joined(&h).await;
        h.transport.set_reachable(ADDRESS, false);

        let record = h.machine.begin_teardown(&record, Intent::Reconfigure);
        let record = advance_to(&h, record, BootstrapState::Failed).await;

        assert_eq!(record.failed_step, Some(BootstrapState::Deconfiguring));
        assert!(!record.non_retryable);
        assert!(h.cluster.node("win-1").is_some());
    }
}
