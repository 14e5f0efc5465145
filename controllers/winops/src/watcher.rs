//! Kubernetes resource watchers.
//!
//! Both watchers use a generic `watch_resource()` helper built on
//! `kube_runtime::Controller`, which handles reconnection and retries:
//!
//! - `WindowsInstance` changes wake the fleet loop (the loop itself is
//!   level-triggered; the watch only shortens the wait)
//! - `CertificateSigningRequest` changes are fed to the approval gate

use crate::approver::ApprovalGate;
use crate::error::ControllerError;
use cluster_client::client::certificate_request_from_csr;
use crds::WindowsInstance;
use crds::annotations::KUBELET_CLIENT_SIGNER;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::Api;
use kube_runtime::{Controller, controller::{Action, Config as ControllerConfig}, watcher};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info};

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Action, ControllerError>> + Send>>;

/// Generic watcher helper around `kube_runtime::Controller`
///
/// `reconcile_fn` is called for every changed object with the shared context.
async fn watch_resource<K, C, F>(
    api: Api<K>,
    context: Arc<C>,
    reconcile_fn: F,
    resource_name: &'static str,
    concurrency: u16,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = move |_obj: Arc<K>, error: &ControllerError, _ctx: Arc<C>| {
        error!("{} handling failed: {}", resource_name, error);
        Action::requeue(Duration::from_secs(30))
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<C>| {
        let reconcile_fn = reconcile_fn.clone();
        async move { reconcile_fn(ctx, obj).await }
    };

    // Debounce batches bursts of status writes into one wake-up
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(concurrency);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .run(reconcile, error_policy, context)
        .for_each(|res| async move {
            if let Err(e) = res {
                debug!("{} controller event error: {}", resource_name, e);
            }
        })
        .await;

    Err(ControllerError::Watch(format!("{resource_name} watch stream ended")))
}

/// Watches the resources the operator reacts to
pub struct Watcher {
    instance_api: Api<WindowsInstance>,
    csr_api: Api<CertificateSigningRequest>,
    trigger: Arc<Notify>,
    gate: Arc<ApprovalGate>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        instance_api: Api<WindowsInstance>,
        csr_api: Api<CertificateSigningRequest>,
        trigger: Arc<Notify>,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            instance_api,
            csr_api,
            trigger,
            gate,
        }
    }

    /// Wake the fleet loop on every `WindowsInstance` change
    pub async fn watch_instances(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.instance_api.clone(),
            Arc::clone(&self.trigger),
            |trigger: Arc<Notify>, instance: Arc<WindowsInstance>| {
                Box::pin(async move {
                    debug!("WindowsInstance {:?} changed", instance.metadata.name);
                    trigger.notify_one();
                    Ok(Action::await_change())
                })
            },
            "WindowsInstance",
            1,
        )
        .await
    }

    /// Decide node certificate requests as they appear
    pub async fn watch_certificate_requests(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.csr_api.clone(),
            Arc::clone(&self.gate),
            |gate: Arc<ApprovalGate>, csr: Arc<CertificateSigningRequest>| {
                Box::pin(async move {
                    if csr.spec.signer_name != KUBELET_CLIENT_SIGNER {
                        return Ok(Action::await_change());
                    }
                    let request = certificate_request_from_csr(&csr)?;
                    gate.handle(&request).await?;
                    Ok(Action::await_change())
                })
            },
            "CertificateSigningRequest",
            1,
        )
        .await
    }
}
