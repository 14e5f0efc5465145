//! Main controller implementation.
//!
//! [`FleetLoop`] is the only scheduling loop: each pass lists the desired set
//! and the records, plans with [`reconcile`] and hands actions to the
//! [`Dispatcher`]. Passes run on a timer and whenever a watch or a finished
//! worker signals a change.
//!
//! [`Controller`] wires the loop, the watchers, the approval gate and the
//! health probes together and runs them until one of them exits.

use crate::approver::ApprovalGate;
use crate::backoff::BackoffPolicy;
use crate::bootstrap::{BootstrapMachine, Collaborators};
use crate::config::OperatorConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::ControllerError;
use crate::fingerprint::{PayloadManifest, SharedTracker, VersionTracker};
use crate::probes::serve_probes;
use crate::reconciler::{Worker, reconcile};
use crate::store::{InstanceStore, KubeInstanceStore};
use crate::watcher::Watcher;
use chrono::Utc;
use cluster_client::{
    CertificateAuthority, KubeCertificateAuthority, KubeClusterMembership, MachineLifecycle, SshTransport,
};
use crds::WindowsInstance;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::{Api, Client};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counts of what one pass dispatched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Actions started
    pub started: usize,
    /// Actions merged into one already in flight
    pub coalesced: usize,
    /// Instances with nothing to do
    pub idle: usize,
}

/// Level-triggered fleet reconciliation loop
pub struct FleetLoop {
    store: Arc<dyn InstanceStore>,
    tracker: SharedTracker,
    dispatcher: Arc<Dispatcher>,
    retry: BackoffPolicy,
    interval: Duration,
    trigger: Arc<Notify>,
    ready: Arc<AtomicBool>,
}

impl FleetLoop {
    /// Create the loop
    pub fn new(
        store: Arc<dyn InstanceStore>,
        tracker: SharedTracker,
        dispatcher: Arc<Dispatcher>,
        retry: BackoffPolicy,
        interval: Duration,
        trigger: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            tracker,
            dispatcher,
            retry,
            interval,
            trigger,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once the first pass has completed
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// Run one pass
    ///
    /// Listing failures abort the pass before anything is dispatched.
    pub async fn reconcile_once(&self) -> Result<PassSummary, ControllerError> {
        let desired = self.store.list_desired().await?;
        let actual = self.store.list_records().await?;
        let tracker = self.tracker.current();

        let mut summary = PassSummary::default();
        for action in reconcile(&desired, &actual, &tracker, &self.retry, Utc::now()) {
            match self.dispatcher.dispatch(action) {
                DispatchOutcome::Started => summary.started += 1,
                DispatchOutcome::Coalesced => summary.coalesced += 1,
                DispatchOutcome::Skipped => summary.idle += 1,
            }
        }
        debug!(
            "Reconciliation pass: {} desired, {} records, {} started, {} in flight, {} idle",
            desired.len(),
            actual.len(),
            summary.started,
            summary.coalesced,
            summary.idle
        );
        Ok(summary)
    }

    /// Run passes forever
    pub async fn run(&self) -> Result<(), ControllerError> {
        info!(
            "Fleet reconciliation loop running (interval {}s)",
            self.interval.as_secs()
        );
        loop {
            match self.reconcile_once().await {
                Ok(_) => self.ready.store(true, Ordering::SeqCst),
                Err(e) => warn!("Reconciliation pass skipped: {}", e),
            }
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                () = self.trigger.notified() => {}
            }
        }
    }
}

/// Main controller for Windows instance management.
pub struct Controller {
    fleet_loop: JoinHandle<Result<(), ControllerError>>,
    instance_watcher: JoinHandle<Result<(), ControllerError>>,
    csr_watcher: JoinHandle<Result<(), ControllerError>>,
    approval_sweeper: JoinHandle<Result<(), ControllerError>>,
    probe_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: OperatorConfig) -> Result<Self, ControllerError> {
        info!("Initializing WinOps Controller");

        let kube_client = Client::try_default().await?;

        let manifest = PayloadManifest::from_dir(&config.payload_dir)?;
        let tracker = VersionTracker::new(manifest, config.network.clone(), config.operator_version.clone());
        info!(
            "Configuration fingerprint {} ({} payload files, network {}, build {})",
            tracker.current_fingerprint(),
            tracker.manifest().files().len(),
            tracker.network().network_type,
            tracker.build()
        );
        let tracker = SharedTracker::new(tracker);

        let store: Arc<dyn InstanceStore> =
            Arc::new(KubeInstanceStore::new(kube_client.clone(), &config.namespace));
        // The gate only approves requests whose keys the bootstrap steps hold,
        // so both must share one authority
        let ca: Arc<dyn CertificateAuthority> = Arc::new(KubeCertificateAuthority::new(kube_client.clone()));
        let collaborators = Collaborators {
            transport: Arc::new(SshTransport::default()),
            ca: Arc::clone(&ca),
            membership: Arc::new(KubeClusterMembership::new(kube_client.clone())),
        };
        let lifecycle = Arc::new(MachineLifecycle::new(kube_client.clone(), "openshift-machine-api"));

        let machine = Arc::new(BootstrapMachine::new(
            collaborators,
            tracker.clone(),
            config.private_key_path.clone(),
            config.api_server_url.clone(),
            config.bootstrap,
        ));
        let worker = Arc::new(Worker::new(Arc::clone(&store), machine, lifecycle, config.retry));
        let trigger = Arc::new(Notify::new());
        let dispatcher = Arc::new(Dispatcher::new(
            worker,
            config.max_concurrent_reconciles,
            Arc::clone(&trigger),
        ));
        let fleet = Arc::new(FleetLoop::new(
            Arc::clone(&store),
            tracker,
            dispatcher,
            config.retry,
            config.reconcile_interval,
            Arc::clone(&trigger),
        ));
        let gate = Arc::new(ApprovalGate::new(ca, store));

        let watcher_instance = Arc::new(Watcher::new(
            Api::<WindowsInstance>::namespaced(kube_client.clone(), &config.namespace),
            Api::<CertificateSigningRequest>::all(kube_client),
            trigger,
            Arc::clone(&gate),
        ));

        let ready = fleet.ready_flag();
        let fleet_loop = tokio::spawn(async move { fleet.run().await });

        let instance_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_instances().await })
        };

        let csr_watcher = {
            let watcher = watcher_instance;
            tokio::spawn(async move { watcher.watch_certificate_requests().await })
        };

        // Catches requests whose watch event was handled while the gate could not decide
        let approval_sweeper = {
            let interval = config.reconcile_interval;
            tokio::spawn(async move {
                gate.run(interval).await;
                Ok::<(), ControllerError>(())
            })
        };

        let probe_server = {
            let addr = config.probe_addr;
            tokio::spawn(async move { serve_probes(addr, ready).await })
        };

        Ok(Self {
            fleet_loop,
            instance_watcher,
            csr_watcher,
            approval_sweeper,
            probe_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("WinOps Controller running");

        // Every task runs forever; whichever exits first ends the process
        tokio::select! {
            result = &mut self.fleet_loop => {
                result.map_err(|e| ControllerError::Watch(format!("Fleet loop panicked: {}", e)))??;
            }
            result = &mut self.instance_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("WindowsInstance watcher panicked: {}", e)))??;
            }
            result = &mut self.csr_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("CSR watcher panicked: {}", e)))??;
            }
            result = &mut self.approval_sweeper => {
                result.map_err(|e| ControllerError::Watch(format!("Approval sweeper panicked: {}", e)))??;
            }
            result = &mut self.probe_server => {
                result.map_err(|e| ControllerError::Watch(format!("Probe server panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
