//! Collaborator clients for the WinOps operator
//!
//! The operator drives Windows instances through capabilities it does not
//! implement itself. This crate defines those capabilities as traits and
//! provides the production implementations:
//!
//! - **Remote transport**: [`SshTransport`] wraps the system `ssh`/`scp` clients
//! - **Certificate authority**: [`KubeCertificateAuthority`] uses `certificates.k8s.io/v1`
//! - **Cluster membership**: [`KubeClusterMembership`] reads and patches core/v1 `Node`s
//! - **Instance lifecycle**: [`MachineLifecycle`] deletes the backing `Machine` object
//!
//! Remote commands are built from the typed [`HostCommand`] vocabulary so that
//! every effect on an instance can be checked before it is applied.
//!
//! With the `test-util` feature, in-memory doubles ([`MockTransport`],
//! [`MockCluster`]) are available for unit tests.

pub mod client;
pub mod error;
pub mod models;
pub mod ssh;
#[path = "trait.rs"]
pub mod cluster_trait;
pub mod windows;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{KubeCertificateAuthority, KubeClusterMembership, MachineLifecycle};
pub use cluster_trait::{CertificateAuthority, ClusterMembership, InstanceLifecycle, RemoteTransport};
pub use error::ClientError;
pub use models::*;
pub use ssh::SshTransport;
pub use windows::HostCommand;
#[cfg(feature = "test-util")]
pub use mock::{MockCluster, MockTransport};
