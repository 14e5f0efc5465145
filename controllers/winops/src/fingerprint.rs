//! Configuration version tracking.
//!
//! The fingerprint of the operator's current configuration is a hex SHA-256
//! over the payload manifest (sorted file name to checksum), the cluster
//! network parameters and the operator build identity. An instance whose
//! recorded fingerprint differs is stale and gets reconfigured.

use crate::config::ClusterNetwork;
use crate::error::ControllerError;
use crds::InstanceRecord;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Directory on the instance that payload files are staged into
pub const REMOTE_PAYLOAD_DIR: &str = "C:\\k";

/// One payload file to stage on every instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFile {
    /// Path relative to the payload directory, `/`-separated
    pub name: String,
    /// Local file to copy
    pub local_path: PathBuf,
    /// Destination on the instance
    pub remote_path: String,
    /// Upper-case hex SHA-256 of the contents
    pub sha256: String,
}

/// Every payload file, sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadManifest {
    files: Vec<PayloadFile>,
}

impl PayloadManifest {
    /// Hash every regular file under `dir`
    pub fn from_dir(dir: &Path) -> Result<Self, ControllerError> {
        let mut files = Vec::new();
        collect_files(dir, dir, &mut files)?;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Payload manifest for {}: {} files", dir.display(), files.len());
        Ok(Self { files })
    }

    /// Build a manifest from already-known files
    pub fn from_files(mut files: Vec<PayloadFile>) -> Self {
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Self { files }
    }

    /// Files in name order
    pub fn files(&self) -> &[PayloadFile] {
        &self.files
    }

    /// Remote directories the files are staged into, deduplicated
    pub fn remote_dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self
            .files
            .iter()
            .filter_map(|f| f.remote_path.rsplit_once('\\').map(|(dir, _)| dir.to_string()))
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PayloadFile>) -> Result<(), ControllerError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ControllerError::Payload(format!("cannot read {}: {e}", dir.display())))?;
    for entry in entries {
        let path = entry?.path();
        let file_type = std::fs::metadata(&path)?.file_type();
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| ControllerError::Payload(e.to_string()))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let contents = std::fs::read(&path)?;
            out.push(PayloadFile {
                remote_path: format!("{REMOTE_PAYLOAD_DIR}\\{}", name.replace('/', "\\")),
                sha256: hex::encode_upper(Sha256::digest(&contents)),
                local_path: path,
                name,
            });
        }
    }
    Ok(())
}

/// Computes and compares configuration fingerprints
#[derive(Debug, Clone)]
pub struct VersionTracker {
    manifest: PayloadManifest,
    network: ClusterNetwork,
    build: String,
    fingerprint: String,
}

impl VersionTracker {
    /// Create a tracker for the given configuration
    pub fn new(manifest: PayloadManifest, network: ClusterNetwork, build: impl Into<String>) -> Self {
        let build = build.into();
        let fingerprint = compute_fingerprint(&manifest, &network, &build);
        Self {
            manifest,
            network,
            build,
            fingerprint,
        }
    }

    /// Fingerprint of the current configuration
    pub fn current_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Whether `record` was configured with something other than the current configuration
    pub fn is_stale(&self, record: &InstanceRecord) -> bool {
        record.fingerprint.as_deref() != Some(self.fingerprint.as_str())
    }

    /// Payload the current configuration stages
    pub fn manifest(&self) -> &PayloadManifest {
        &self.manifest
    }

    /// Network parameters of the current configuration
    pub fn network(&self) -> &ClusterNetwork {
        &self.network
    }

    /// Operator build identity
    pub fn build(&self) -> &str {
        &self.build
    }
}

fn compute_fingerprint(manifest: &PayloadManifest, network: &ClusterNetwork, build: &str) -> String {
    let mut hasher = Sha256::new();
    for file in manifest.files() {
        hasher.update(format!("payload:{}:{}\n", file.name, file.sha256));
    }
    hasher.update(format!("network-type:{}\n", network.network_type));
    hasher.update(format!("cluster-cidr:{}\n", network.cluster_cidr));
    hasher.update(format!("service-cidr:{}\n", network.service_cidr));
    hasher.update(format!("vxlan-port:{}\n", network.vxlan_port));
    hasher.update(format!("build:{build}\n"));
    hex::encode(hasher.finalize())
}

/// The tracker in effect, replaceable while the operator runs
#[derive(Debug, Clone)]
pub struct SharedTracker(Arc<RwLock<Arc<VersionTracker>>>);

impl SharedTracker {
    /// Wrap a tracker
    pub fn new(tracker: VersionTracker) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(tracker))))
    }

    /// Snapshot of the tracker in effect
    pub fn current(&self) -> Arc<VersionTracker> {
        Arc::clone(&self.0.read().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Switch to a new configuration
    pub fn replace(&self, tracker: VersionTracker) {
        *self.0.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(tracker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_network, create_test_payload_dir, create_test_record};

    fn file(name: &str, sha: &str) -> PayloadFile {
        PayloadFile {
            name: name.to_string(),
            local_path: PathBuf::from(format!("/payload/{name}")),
            remote_path: format!("C:\\k\\{name}"),
            sha256: sha.to_string(),
        }
    }

    #[test]
    fn test_fingerprint_ignores_listing_order() {
        let a = PayloadManifest::from_files(vec![file("kubelet.exe", "AA"), file("kube-proxy.exe", "BB")]);
        let b = PayloadManifest::from_files(vec![file("kube-proxy.exe", "BB"), file("kubelet.exe", "AA")]);
        let t1 = VersionTracker::new(a, create_test_network(), "1.0.0");
        let t2 = VersionTracker::new(b, create_test_network(), "1.0.0");
        assert_eq!(t1.current_fingerprint(), t2.current_fingerprint());
        assert_eq!(t1.current_fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_covers_every_input() {
        let manifest = PayloadManifest::from_files(vec![file("kubelet.exe", "AA")]);
        let base = VersionTracker::new(manifest.clone(), create_test_network(), "1.0.0");

        let changed_binary = VersionTracker::new(
            PayloadManifest::from_files(vec![file("kubelet.exe", "AB")]),
            create_test_network(),
            "1.0.0",
        );
        let mut network = create_test_network();
        network.vxlan_port = 9898;
        let changed_port = VersionTracker::new(manifest.clone(), network, "1.0.0");
        let mut network = create_test_network();
        network.service_cidr = "172.31.0.0/16".to_string();
        let changed_cidr = VersionTracker::new(manifest.clone(), network, "1.0.0");
        let changed_build = VersionTracker::new(manifest, create_test_network(), "1.0.1");

        for other in [&changed_binary, &changed_port, &changed_cidr, &changed_build] {
            assert_ne!(base.current_fingerprint(), other.current_fingerprint());
        }
    }

    #[test]
    fn test_is_stale() {
        let tracker = VersionTracker::new(PayloadManifest::default(), create_test_network(), "1.0.0");
        let mut record = create_test_record("win-1", "10.0.0.5");
        assert!(tracker.is_stale(&record), "record without fingerprint is stale");
        record.fingerprint = Some(tracker.current_fingerprint().to_string());
        assert!(!tracker.is_stale(&record));
        record.fingerprint = Some("0".repeat(64));
        assert!(tracker.is_stale(&record));
    }

    #[test]
    fn test_manifest_from_dir() {
        let dir = create_test_payload_dir(&[
            ("kubelet.exe", b"kubelet".as_slice()),
            ("cni/win-overlay.exe", b"overlay".as_slice()),
        ]);
        let manifest = PayloadManifest::from_dir(&dir).unwrap();
        let names: Vec<&str> = manifest.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["cni/win-overlay.exe", "kubelet.exe"]);
        assert_eq!(manifest.files()[0].remote_path, "C:\\k\\cni\\win-overlay.exe");
        assert_eq!(
            manifest.files()[1].sha256,
            hex::encode_upper(Sha256::digest(b"kubelet"))
        );
        assert_eq!(manifest.remote_dirs(), vec!["C:\\k".to_string(), "C:\\k\\cni".to_string()]);
        let _ = std::fs::remove_dir_all(dir);
    }
}
