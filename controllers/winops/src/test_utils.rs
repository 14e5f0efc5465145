//! Test utilities for unit and scenario tests
//!
//! Provides an in-memory [`InstanceStore`], fixtures, and a harness that
//! wires the real controller pieces to the `cluster-client` mocks.

use crate::approver::ApprovalGate;
use crate::backoff::BackoffPolicy;
use crate::bootstrap::{BootstrapMachine, Collaborators};
use crate::config::{BootstrapSettings, ClusterNetwork};
use crate::controller::FleetLoop;
use crate::dispatcher::Dispatcher;
use crate::error::ControllerError;
use crate::fingerprint::{PayloadManifest, SharedTracker, VersionTracker};
use crate::reconciler::Worker;
use crate::store::{DesiredInstance, InstanceStore};
use chrono::Utc;
use cluster_client::{MockCluster, MockTransport};
use crds::{BootstrapState, InstanceRecord, NetworkRole, WindowsInstanceSpec};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// In-memory record store
#[derive(Clone, Default)]
pub struct MemoryStore {
    desired: Arc<Mutex<BTreeMap<String, WindowsInstanceSpec>>>,
    records: Arc<Mutex<BTreeMap<String, InstanceRecord>>>,
    fail_listing: Arc<AtomicBool>,
    history: Arc<Mutex<Vec<(String, BootstrapState)>>>,
}

impl MemoryStore {
    /// Declare an instance
    pub fn add_desired(&self, id: &str, spec: WindowsInstanceSpec) {
        self.desired.lock().unwrap().insert(id.to_string(), spec);
    }

    /// Withdraw an instance (as deleting its `WindowsInstance` would)
    pub fn remove_desired(&self, id: &str) {
        self.desired.lock().unwrap().remove(id);
    }

    /// Insert a record directly
    pub fn put_record(&self, record: InstanceRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.instance_id.clone(), record);
    }

    /// Current record of an instance
    pub fn record(&self, id: &str) -> Option<InstanceRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    /// Make listing fail (or succeed again)
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Every state an instance's record was saved in, in order
    pub fn states_of(&self, id: &str) -> Vec<BootstrapState> {
        let mut states: Vec<BootstrapState> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| i == id)
            .map(|(_, s)| *s)
            .collect();
        states.dedup();
        states
    }

    /// Stored record with connection details refreshed from the desired spec
    fn current_record(&self, id: &str) -> Option<InstanceRecord> {
        let mut record = self.record(id)?;
        if let Some(spec) = self.desired.lock().unwrap().get(id) {
            record.refresh_connection(spec);
        }
        Some(record)
    }

    fn check_listing(&self) -> Result<(), ControllerError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(ControllerError::Store("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl InstanceStore for MemoryStore {
    async fn list_desired(&self) -> Result<Vec<DesiredInstance>, ControllerError> {
        self.check_listing()?;
        Ok(self
            .desired
            .lock()
            .unwrap()
            .iter()
            .map(|(id, spec)| DesiredInstance {
                id: id.clone(),
                spec: spec.clone(),
            })
            .collect())
    }

    async fn list_records(&self) -> Result<Vec<InstanceRecord>, ControllerError> {
        self.check_listing()?;
        let ids: Vec<String> = self.records.lock().unwrap().keys().cloned().collect();
        Ok(ids.iter().filter_map(|id| self.current_record(id)).collect())
    }

    async fn get_desired(&self, instance_id: &str) -> Result<Option<DesiredInstance>, ControllerError> {
        Ok(self
            .desired
            .lock()
            .unwrap()
            .get(instance_id)
            .map(|spec| DesiredInstance {
                id: instance_id.to_string(),
                spec: spec.clone(),
            }))
    }

    async fn get_record(&self, instance_id: &str) -> Result<Option<InstanceRecord>, ControllerError> {
        Ok(self.current_record(instance_id))
    }

    async fn create_record(&self, desired: &DesiredInstance) -> Result<InstanceRecord, ControllerError> {
        if let Some(existing) = self.current_record(&desired.id) {
            return Ok(existing);
        }
        let record = InstanceRecord::new(&desired.id, &desired.spec, Utc::now());
        self.save_record(&record).await?;
        Ok(record)
    }

    async fn save_record(&self, record: &InstanceRecord) -> Result<(), ControllerError> {
        self.history
            .lock()
            .unwrap()
            .push((record.instance_id.clone(), record.state));
        self.put_record(record.clone());
        Ok(())
    }

    async fn delete_record(&self, instance_id: &str) -> Result<(), ControllerError> {
        self.records.lock().unwrap().remove(instance_id);
        Ok(())
    }
}

/// Cluster network used throughout the tests
pub fn create_test_network() -> ClusterNetwork {
    ClusterNetwork {
        network_type: "OVNKubernetes".to_string(),
        cluster_cidr: "10.128.0.0/14".to_string(),
        service_cidr: "172.30.0.0/16".to_string(),
        vxlan_port: 4789,
    }
}

/// Spec for an instance at `address`
pub fn create_test_spec(address: &str) -> WindowsInstanceSpec {
    WindowsInstanceSpec {
        address: address.to_string(),
        username: "Administrator".to_string(),
        provider_id: None,
        node_name: None,
        network_role: NetworkRole::Overlay,
    }
}

/// Desired instance `id` at `address`
pub fn create_test_desired(id: &str, address: &str) -> DesiredInstance {
    DesiredInstance {
        id: id.to_string(),
        spec: create_test_spec(address),
    }
}

/// Fresh record for instance `id` at `address`
pub fn create_test_record(id: &str, address: &str) -> InstanceRecord {
    InstanceRecord::new(id, &create_test_spec(address), Utc::now())
}

/// Write `files` into a new temporary payload directory
pub fn create_test_payload_dir(files: &[(&str, &[u8])]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("winops-payload-{}", uuid::Uuid::new_v4()));
    for (name, contents) in files {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
    dir
}

/// Tracker over `dir` with the test network and `build`
pub fn create_test_tracker(dir: &Path, build: &str) -> VersionTracker {
    VersionTracker::new(PayloadManifest::from_dir(dir).unwrap(), create_test_network(), build)
}

/// Short limits so failure paths finish quickly under paused time
pub fn test_settings() -> BootstrapSettings {
    BootstrapSettings {
        max_connect_attempts: 3,
        max_staging_attempts: 3,
        max_step_attempts: 3,
        identity_timeout: Duration::from_secs(60),
        ready_timeout: Duration::from_secs(120),
        poll: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5)),
    }
}

/// Controller pieces wired to in-memory collaborators
pub struct TestHarness {
    pub transport: MockTransport,
    pub cluster: MockCluster,
    pub store: MemoryStore,
    pub tracker: SharedTracker,
    pub machine: Arc<BootstrapMachine>,
    pub dispatcher: Arc<Dispatcher>,
    pub fleet: FleetLoop,
    pub gate: Arc<ApprovalGate>,
    pub payload_dir: PathBuf,
}

impl TestHarness {
    /// Harness with [`test_settings`]
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    /// Harness with custom bootstrap limits
    pub fn with_settings(settings: BootstrapSettings) -> Self {
        let payload_dir = create_test_payload_dir(&[
            ("kubelet.exe", b"kubelet v1.30".as_slice()),
            ("kube-proxy.exe", b"kube-proxy v1.30".as_slice()),
            ("hybrid-overlay-node.exe", b"hybrid-overlay".as_slice()),
            ("cni/win-overlay.exe", b"win-overlay".as_slice()),
        ]);
        let tracker = SharedTracker::new(create_test_tracker(&payload_dir, "1.0.0"));
        let transport = MockTransport::new();
        let cluster = MockCluster::new();
        let store = MemoryStore::default();
        let retry = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10));

        let machine = Arc::new(BootstrapMachine::new(
            Collaborators {
                transport: Arc::new(transport.clone()),
                ca: Arc::new(cluster.clone()),
                membership: Arc::new(cluster.clone()),
            },
            tracker.clone(),
            PathBuf::from("/etc/winops/id_rsa"),
            "https://api.test:6443".to_string(),
            settings,
        ));
        let worker = Arc::new(Worker::new(
            Arc::new(store.clone()),
            Arc::clone(&machine),
            Arc::new(cluster.clone()),
            retry,
        ));
        let trigger = Arc::new(Notify::new());
        let dispatcher = Arc::new(Dispatcher::new(worker, 4, Arc::clone(&trigger)));
        let fleet = FleetLoop::new(
            Arc::new(store.clone()),
            tracker.clone(),
            Arc::clone(&dispatcher),
            retry,
            Duration::from_secs(60),
            trigger,
        );
        let gate = Arc::new(ApprovalGate::new(Arc::new(cluster.clone()), Arc::new(store.clone())));

        Self {
            transport,
            cluster,
            store,
            tracker,
            machine,
            dispatcher,
            fleet,
            gate,
            payload_dir,
        }
    }

    /// Declare instance `id` backed by a reachable host at `address`
    pub fn add_instance(&self, id: &str, address: &str) {
        self.transport.add_host(address);
        self.store.add_desired(id, create_test_spec(address));
    }

    /// Run the approval gate in the background
    pub fn spawn_gate(&self) -> tokio::task::JoinHandle<()> {
        let gate = Arc::clone(&self.gate);
        tokio::spawn(async move { gate.run(Duration::from_secs(1)).await })
    }

    /// Run passes until one dispatches nothing; returns the number of passes
    pub async fn settle(&self, max_passes: usize) -> usize {
        for pass in 1..=max_passes {
            let summary = self.fleet.reconcile_once().await.unwrap();
            self.dispatcher.wait_idle().await;
            if summary.started == 0 && summary.coalesced == 0 {
                return pass;
            }
        }
        panic!("fleet did not settle within {max_passes} passes");
    }

    /// Change the payload and switch the tracker to it
    pub fn upgrade_payload(&self, build: &str) {
        std::fs::write(self.payload_dir.join("kubelet.exe"), format!("kubelet {build}")).unwrap();
        self.tracker
            .replace(create_test_tracker(&self.payload_dir, build));
    }

    /// Fingerprint currently in effect
    pub fn current_fingerprint(&self) -> String {
        self.tracker.current().current_fingerprint().to_string()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.payload_dir);
    }
}
