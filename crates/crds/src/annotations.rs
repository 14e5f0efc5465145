//! Annotation, finalizer and identity constants shared by the operator.
//!
//! Everything an operator (or a test) needs to observe bootstrap progress
//! without reading controller internals is keyed by these names.

/// API group of all WinOps resources
pub const API_GROUP: &str = "winops.microscaler.io";

/// Finalizer that keeps a `WindowsInstance` alive until its record reaches `Removed`
pub const RECORD_FINALIZER: &str = "winops.microscaler.io/instance-record";

/// Node annotation carrying the configuration fingerprint the node was provisioned from
pub const VERSION_ANNOTATION: &str = "winops.microscaler.io/version";

/// Node annotation mirroring the bootstrap state of the backing instance
pub const STATE_ANNOTATION: &str = "winops.microscaler.io/bootstrap-state";

/// Node label selecting Windows nodes
pub const OS_LABEL: &str = "kubernetes.io/os";

/// Prefix of node identities in certificate subjects
pub const NODE_USER_PREFIX: &str = "system:node:";

/// Group every node identity must belong to
pub const NODES_GROUP: &str = "system:nodes";

/// Group added by the API server to any authenticated request
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Signer used for kubelet client certificates
pub const KUBELET_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client-kubelet";
