//! Instance record storage.
//!
//! The desired set is every `WindowsInstance` without a deletion timestamp;
//! the actual set is every record, stored as a `WindowsInstance` status and
//! kept alive by the record finalizer until the instance reaches `Removed`.

use crate::error::ControllerError;
use chrono::Utc;
use crds::annotations::RECORD_FINALIZER;
use crds::{InstanceRecord, WindowsInstance, WindowsInstanceSpec};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, info};

/// Field manager used for status writes
const FIELD_MANAGER: &str = "winops-controller";

/// One member of the desired set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredInstance {
    /// Stable instance identifier
    pub id: String,
    /// Declared configuration
    pub spec: WindowsInstanceSpec,
}

/// Read/write access to desired instances and their records
#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    /// Every instance that should be joined
    async fn list_desired(&self) -> Result<Vec<DesiredInstance>, ControllerError>;

    /// Every existing record
    async fn list_records(&self) -> Result<Vec<InstanceRecord>, ControllerError>;

    /// The desired configuration of one instance, if it is still desired
    async fn get_desired(&self, instance_id: &str) -> Result<Option<DesiredInstance>, ControllerError>;

    /// The record of one instance, if any
    async fn get_record(&self, instance_id: &str) -> Result<Option<InstanceRecord>, ControllerError>;

    /// Create the record for a desired instance (returns the existing one if present)
    async fn create_record(&self, desired: &DesiredInstance) -> Result<InstanceRecord, ControllerError>;

    /// Persist a record
    async fn save_record(&self, record: &InstanceRecord) -> Result<(), ControllerError>;

    /// Delete a record; deleting a missing record is not an error
    async fn delete_record(&self, instance_id: &str) -> Result<(), ControllerError>;
}

/// Status record of `instance` with connection details taken from its spec
fn current_record(instance: WindowsInstance) -> Option<InstanceRecord> {
    let mut record = instance.status?;
    record.refresh_connection(&instance.spec);
    Some(record)
}

/// Record store backed by `WindowsInstance` objects
#[derive(Clone)]
pub struct KubeInstanceStore {
    api: Api<WindowsInstance>,
}

impl KubeInstanceStore {
    /// Create a store over `WindowsInstance` objects in `namespace`
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    async fn set_finalizers(&self, instance: &WindowsInstance, finalizers: Vec<String>) -> Result<(), ControllerError> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": instance.resource_version(),
            }
        });
        self.api
            .patch(&instance.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl InstanceStore for KubeInstanceStore {
    async fn list_desired(&self) -> Result<Vec<DesiredInstance>, ControllerError> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|wi| wi.metadata.deletion_timestamp.is_none())
            .map(|wi| DesiredInstance {
                id: wi.name_any(),
                spec: wi.spec,
            })
            .collect())
    }

    async fn list_records(&self) -> Result<Vec<InstanceRecord>, ControllerError> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().filter_map(current_record).collect())
    }

    async fn get_desired(&self, instance_id: &str) -> Result<Option<DesiredInstance>, ControllerError> {
        Ok(self
            .api
            .get_opt(instance_id)
            .await?
            .filter(|wi| wi.metadata.deletion_timestamp.is_none())
            .map(|wi| DesiredInstance {
                id: wi.name_any(),
                spec: wi.spec,
            }))
    }

    async fn get_record(&self, instance_id: &str) -> Result<Option<InstanceRecord>, ControllerError> {
        Ok(self.api.get_opt(instance_id).await?.and_then(current_record))
    }

    async fn create_record(&self, desired: &DesiredInstance) -> Result<InstanceRecord, ControllerError> {
        let instance = self
            .api
            .get_opt(&desired.id)
            .await?
            .ok_or_else(|| ControllerError::Store(format!("WindowsInstance {} not found", desired.id)))?;
        if let Some(mut existing) = instance.status.clone() {
            existing.refresh_connection(&instance.spec);
            return Ok(existing);
        }

        if !instance.finalizers().iter().any(|f| f == RECORD_FINALIZER) {
            let mut finalizers = instance.finalizers().to_vec();
            finalizers.push(RECORD_FINALIZER.to_string());
            self.set_finalizers(&instance, finalizers).await?;
            debug!("Added record finalizer to WindowsInstance {}", desired.id);
        }

        let record = InstanceRecord::new(&desired.id, &desired.spec, Utc::now());
        self.save_record(&record).await?;
        info!("Created record for instance {} ({})", record.instance_id, record.address);
        Ok(record)
    }

    async fn save_record(&self, record: &InstanceRecord) -> Result<(), ControllerError> {
        // Server-side apply of the whole status drops fields the record no longer sets
        let patch = serde_json::json!({
            "apiVersion": WindowsInstance::api_version(&()),
            "kind": WindowsInstance::kind(&()),
            "status": record,
        });
        self.api
            .patch_status(
                &record.instance_id,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await?;
        Ok(())
    }

    async fn delete_record(&self, instance_id: &str) -> Result<(), ControllerError> {
        let Some(instance) = self.api.get_opt(instance_id).await? else {
            return Ok(());
        };

        if instance.metadata.deletion_timestamp.is_none() && instance.status.is_some() {
            let patch = serde_json::json!({ "status": null });
            self.api
                .patch_status(instance_id, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }

        if instance.finalizers().iter().any(|f| f == RECORD_FINALIZER) {
            let finalizers: Vec<String> = instance
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != RECORD_FINALIZER)
                .cloned()
                .collect();
            match self.set_finalizers(&instance, finalizers).await {
                Ok(()) => {}
                // Already gone
                Err(ControllerError::Kube(kube::Error::Api(resp))) if resp.code == 404 => {}
                Err(e) => return Err(e),
            }
        }
        info!("Deleted record for instance {}", instance_id);
        Ok(())
    }
}
