//! Mock collaborators for unit testing
//!
//! This module provides in-memory implementations of the collaborator traits
//! that can be used in unit tests without a cluster or real instances.
//!
//! The mock is organized by collaborator:
//! - `transport.rs` - simulated Windows hosts behind `RemoteTransport`
//! - `cluster.rs` - CSRs, nodes and machines behind the cluster traits

mod cluster;
mod transport;

pub use cluster::{MockCluster, MockNode, TerminateHook};
pub use transport::MockTransport;
