//! Prints the WinOps CRD manifests as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > deploy/crds.yaml`

use crds::WindowsInstance;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crd = WindowsInstance::crd();
    print!("---\n{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
