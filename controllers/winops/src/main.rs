//! WinOps Controller
//!
//! Joins Windows instances to the cluster and keeps them there:
//! - WindowsInstance: declares an instance; its status is the operator's record
//! - Bootstrap: stages the node payload, configures networking, obtains a node
//!   identity and starts the node services over SSH
//! - Approval: approves node certificate requests only for instances that are
//!   waiting for exactly that identity
//! - Drift: instances provisioned from an older configuration are torn down
//!   and joined again

mod approver;
mod backoff;
mod bootstrap;
mod config;
mod controller;
mod dispatcher;
mod error;
mod fingerprint;
mod probes;
mod reconciler;
mod store;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube uses rustls; pick the ring provider explicitly
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting WinOps Controller");

    let config = OperatorConfig::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  Payload directory: {}", config.payload_dir.display());
    info!("  Network type: {}", config.network.network_type);
    info!("  Cluster CIDR: {}", config.network.cluster_cidr);
    info!("  Service CIDR: {}", config.network.service_cidr);
    info!("  Max concurrent reconciles: {}", config.max_concurrent_reconciles);
    info!("  Reconcile interval: {}s", config.reconcile_interval.as_secs());

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
