//! Network plugin selection and CNI configuration.

use crate::config::ClusterNetwork;
use crate::error::StepError;
use crate::fingerprint::REMOTE_PAYLOAD_DIR;
use crds::NetworkRole;

/// Where the CNI configuration lives on the instance
pub const CNI_CONFIG_PATH: &str = "C:\\k\\cni\\config\\cni.conf";

/// Network plugin the instance runs to join the pod network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPlugin {
    /// OVN-Kubernetes hybrid overlay
    HybridOverlay,
}

impl NetworkPlugin {
    /// Pick the plugin for the cluster's network mode
    pub fn select(network: &ClusterNetwork) -> Result<Self, StepError> {
        match network.network_type.as_str() {
            t if t.eq_ignore_ascii_case("OVNKubernetes") => Ok(NetworkPlugin::HybridOverlay),
            t if t.eq_ignore_ascii_case("OpenShiftSDN") => Err(StepError::Configuration(
                "network type OpenShiftSDN does not support Windows nodes".to_string(),
            )),
            other => Err(StepError::Configuration(format!("unsupported network type {other:?}"))),
        }
    }

    /// Windows service running the plugin
    pub fn service_name(&self) -> &'static str {
        match self {
            NetworkPlugin::HybridOverlay => "hybrid-overlay-node",
        }
    }

    /// Service command line for `node_name`
    pub fn service_binary(&self, network: &ClusterNetwork, node_name: &str) -> String {
        match self {
            NetworkPlugin::HybridOverlay => format!(
                "{REMOTE_PAYLOAD_DIR}\\hybrid-overlay-node.exe --node {node_name} --hybrid-overlay-vxlan-port={} --k8s-kubeconfig {REMOTE_PAYLOAD_DIR}\\kubeconfig --windows-service --logfile {REMOTE_PAYLOAD_DIR}\\log\\hybrid-overlay.log",
                network.vxlan_port
            ),
        }
    }
}

/// Render the CNI configuration for an instance
pub fn render_cni_config(network: &ClusterNetwork, role: NetworkRole) -> Result<Vec<u8>, StepError> {
    let config = serde_json::json!({
        "CniVersion": "0.2.0",
        "Name": "OVNKubernetesHybridOverlayNetwork",
        "Type": role.cni_plugin(),
        "apiVersion": 2,
        "Capabilities": {
            "portMappings": true,
            "dns": true,
        },
        "Ipam": {
            "Type": "host-local",
        },
        "Policies": [
            {
                "Name": "EndpointPolicy",
                "Value": {
                    "Type": "OutBoundNAT",
                    "Settings": {
                        "Exceptions": [network.cluster_cidr, network.service_cidr],
                    },
                },
            },
            {
                "Name": "EndpointPolicy",
                "Value": {
                    "Type": "SDNRoute",
                    "Settings": {
                        "DestinationPrefix": network.service_cidr,
                        "NeedEncap": true,
                    },
                },
            },
        ],
    });
    serde_json::to_vec_pretty(&config)
        .map_err(|e| StepError::Configuration(format!("cannot render CNI config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_network;

    #[test]
    fn test_ovn_kubernetes_selects_hybrid_overlay() {
        let plugin = NetworkPlugin::select(&create_test_network()).unwrap();
        assert_eq!(plugin, NetworkPlugin::HybridOverlay);
        assert!(plugin
            .service_binary(&create_test_network(), "win-1")
            .contains("--hybrid-overlay-vxlan-port=4789"));
    }

    #[test]
    fn test_unsupported_network_types_are_configuration_errors() {
        for network_type in ["OpenShiftSDN", "Calico", ""] {
            let mut network = create_test_network();
            network.network_type = network_type.to_string();
            assert!(matches!(
                NetworkPlugin::select(&network),
                Err(StepError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_cni_config_uses_role_plugin_and_cidrs() {
        let network = create_test_network();
        let bytes = render_cni_config(&network, NetworkRole::L2Bridge).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["Type"], "win-bridge");
        assert_eq!(
            value["Policies"][0]["Value"]["Settings"]["Exceptions"][1],
            network.service_cidr.as_str()
        );
        // Rendering is deterministic, so unchanged configs are never rewritten
        assert_eq!(bytes, render_cni_config(&network, NetworkRole::L2Bridge).unwrap());
    }
}
