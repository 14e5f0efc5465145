//! WinOps CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Windows node operator.

pub mod annotations;
pub mod windows_instance;

pub use windows_instance::*;
