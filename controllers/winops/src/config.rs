//! Operator configuration, read once from environment variables at start-up.

use crate::backoff::BackoffPolicy;
use crate::error::ControllerError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Cluster network parameters that shape every instance's network config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNetwork {
    /// Cluster network mode (`OVNKubernetes`, `OpenShiftSDN`, ...)
    pub network_type: String,
    /// Pod network CIDR
    pub cluster_cidr: String,
    /// Service network CIDR
    pub service_cidr: String,
    /// VXLAN port used by the hybrid overlay
    pub vxlan_port: u16,
}

/// Limits and deadlines for a single bootstrap run
#[derive(Debug, Clone, Copy)]
pub struct BootstrapSettings {
    /// Connection attempts before the instance is failed
    pub max_connect_attempts: u32,
    /// Staging attempts before a persisting checksum mismatch is fatal
    pub max_staging_attempts: u32,
    /// Attempts at any other step before the instance is failed
    pub max_step_attempts: u32,
    /// How long to wait for the node certificate to be approved
    pub identity_timeout: Duration,
    /// How long to wait for the node to report Ready
    pub ready_timeout: Duration,
    /// Polling interval policy while waiting
    pub poll: BackoffPolicy,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            max_connect_attempts: 5,
            max_staging_attempts: 3,
            max_step_attempts: 5,
            identity_timeout: Duration::from_secs(600),
            ready_timeout: Duration::from_secs(1800),
            poll: BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(60)),
        }
    }
}

/// Complete operator configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace holding the `WindowsInstance` objects
    pub namespace: String,
    /// SSH private key used to log in to instances
    pub private_key_path: PathBuf,
    /// Local directory holding the node payload
    pub payload_dir: PathBuf,
    /// Cluster network parameters
    pub network: ClusterNetwork,
    /// API server URL written into the node kubeconfig
    pub api_server_url: String,
    /// Operator build identity, part of the fingerprint
    pub operator_version: String,
    /// Maximum number of instances worked on at once
    pub max_concurrent_reconciles: usize,
    /// Period of the fleet reconciliation loop
    pub reconcile_interval: Duration,
    /// Retry policy for failed instances
    pub retry: BackoffPolicy,
    /// Per-run limits
    pub bootstrap: BootstrapSettings,
    /// Listen address of the health probes
    pub probe_addr: SocketAddr,
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` (the environment, or a map in tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let private_key_path = lookup("PRIVATE_KEY_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                ControllerError::InvalidConfig(
                    "PRIVATE_KEY_PATH environment variable is required".to_string(),
                )
            })?;

        let network = ClusterNetwork {
            network_type: lookup("CLUSTER_NETWORK_TYPE").unwrap_or_else(|| "OVNKubernetes".to_string()),
            cluster_cidr: lookup("CLUSTER_CIDR").unwrap_or_else(|| "10.128.0.0/14".to_string()),
            service_cidr: lookup("SERVICE_CIDR").unwrap_or_else(|| "172.30.0.0/16".to_string()),
            vxlan_port: parse_or(&lookup, "VXLAN_PORT", 4789)?,
        };

        let backoff_min = parse_or(&lookup, "BACKOFF_MIN_SECS", 5u64)?;
        let backoff_max = parse_or(&lookup, "BACKOFF_MAX_SECS", 300u64)?;
        if backoff_min == 0 || backoff_min > backoff_max {
            return Err(ControllerError::InvalidConfig(format!(
                "BACKOFF_MIN_SECS ({backoff_min}) must be non-zero and at most BACKOFF_MAX_SECS ({backoff_max})"
            )));
        }

        let max_concurrent_reconciles = parse_or(&lookup, "MAX_CONCURRENT_RECONCILES", 5usize)?;
        if max_concurrent_reconciles == 0 {
            return Err(ControllerError::InvalidConfig(
                "MAX_CONCURRENT_RECONCILES must be at least 1".to_string(),
            ));
        }

        let defaults = BootstrapSettings::default();
        let bootstrap = BootstrapSettings {
            max_connect_attempts: parse_or(&lookup, "MAX_CONNECT_ATTEMPTS", defaults.max_connect_attempts)?.max(1),
            max_staging_attempts: parse_or(&lookup, "MAX_STAGING_ATTEMPTS", defaults.max_staging_attempts)?.max(1),
            max_step_attempts: parse_or(&lookup, "MAX_STEP_ATTEMPTS", defaults.max_step_attempts)?.max(1),
            identity_timeout: Duration::from_secs(parse_or(&lookup, "IDENTITY_TIMEOUT_SECS", 600u64)?),
            ready_timeout: Duration::from_secs(parse_or(&lookup, "READY_TIMEOUT_SECS", 1800u64)?),
            poll: defaults.poll,
        };

        Ok(Self {
            namespace: lookup("WATCH_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            private_key_path,
            payload_dir: lookup("PAYLOAD_DIR").map_or_else(|| PathBuf::from("/payload"), PathBuf::from),
            network,
            api_server_url: lookup("API_SERVER_URL")
                .unwrap_or_else(|| "https://kubernetes.default.svc:443".to_string()),
            operator_version: lookup("OPERATOR_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            max_concurrent_reconciles,
            reconcile_interval: Duration::from_secs(parse_or(&lookup, "RECONCILE_INTERVAL_SECS", 60u64)?.max(1)),
            retry: BackoffPolicy::new(Duration::from_secs(backoff_min), Duration::from_secs(backoff_max)),
            bootstrap,
            probe_addr: parse_or(&lookup, "PROBE_ADDR", SocketAddr::from(([0, 0, 0, 0], 8081)))?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{key}={raw:?} is not valid: {e}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::from_lookup(lookup(&[("PRIVATE_KEY_PATH", "/etc/winops/key")])).unwrap();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.payload_dir, PathBuf::from("/payload"));
        assert_eq!(config.network.network_type, "OVNKubernetes");
        assert_eq!(config.network.vxlan_port, 4789);
        assert_eq!(config.max_concurrent_reconciles, 5);
        assert_eq!(config.reconcile_interval, Duration::from_secs(60));
        assert_eq!(config.bootstrap.max_connect_attempts, 5);
        assert_eq!(config.bootstrap.ready_timeout, Duration::from_secs(1800));
        assert_eq!(config.probe_addr.port(), 8081);
    }

    #[test]
    fn test_private_key_is_required() {
        let err = OperatorConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = OperatorConfig::from_lookup(lookup(&[
            ("PRIVATE_KEY_PATH", "/key"),
            ("VXLAN_PORT", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("VXLAN_PORT"));
    }

    #[test]
    fn test_backoff_bounds_are_checked() {
        let err = OperatorConfig::from_lookup(lookup(&[
            ("PRIVATE_KEY_PATH", "/key"),
            ("BACKOFF_MIN_SECS", "600"),
            ("BACKOFF_MAX_SECS", "60"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }
}
