//! Executes one action for one instance.

use super::Action;
use crate::backoff::BackoffPolicy;
use crate::bootstrap::BootstrapMachine;
use crate::error::ControllerError;
use crate::store::InstanceStore;
use cluster_client::InstanceLifecycle;
use crds::{BootstrapState, InstanceRecord, Intent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Runs actions to completion: drives the record until it is stable
pub struct Worker {
    store: Arc<dyn InstanceStore>,
    machine: Arc<BootstrapMachine>,
    lifecycle: Arc<dyn InstanceLifecycle>,
    step_retry: BackoffPolicy,
}

impl Worker {
    /// Create a worker
    pub fn new(
        store: Arc<dyn InstanceStore>,
        machine: Arc<BootstrapMachine>,
        lifecycle: Arc<dyn InstanceLifecycle>,
        step_retry: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            machine,
            lifecycle,
            step_retry,
        }
    }

    /// Execute `action`; errors are logged, never propagated
    pub async fn run(&self, action: Action, stop: Arc<AtomicBool>) {
        let instance_id = action.instance_id().to_string();
        let kind = action.kind();
        if let Err(e) = self.execute(action, &stop).await {
            error!("Instance {}: {:?} failed: {}", instance_id, kind, e);
        }
    }

    async fn execute(&self, action: Action, stop: &AtomicBool) -> Result<(), ControllerError> {
        let record = match action {
            Action::NoOp(_) => return Ok(()),
            Action::Create(desired) => self.store.create_record(&desired).await?,
            Action::Reconfigure(snapshot) => {
                let Some(current) = self.reload(&snapshot).await? else {
                    return Ok(());
                };
                if current.state != BootstrapState::Ready {
                    debug!(
                        "Instance {}: no longer Ready ({}), not reconfiguring",
                        current.instance_id, current.state
                    );
                    return Ok(());
                }
                info!(
                    "Instance {}: configuration is stale, reconfiguring",
                    current.instance_id
                );
                let next = self.machine.begin_teardown(&current, Intent::Reconfigure);
                self.store.save_record(&next).await?;
                next
            }
            Action::Delete(snapshot) => {
                let Some(current) = self.reload(&snapshot).await? else {
                    return Ok(());
                };
                match current.state {
                    BootstrapState::Removed | BootstrapState::Deconfiguring if current.intent == Intent::Remove => {
                        current
                    }
                    // Teardown already done or underway, only the outcome changes
                    BootstrapState::Removed | BootstrapState::Deconfiguring => {
                        info!(
                            "Instance {}: removing ({} teardown already started)",
                            current.instance_id, current.state
                        );
                        let mut next = current;
                        next.intent = Intent::Remove;
                        self.store.save_record(&next).await?;
                        next
                    }
                    _ => {
                        info!("Instance {}: removing", current.instance_id);
                        let next = self.machine.begin_teardown(&current, Intent::Remove);
                        self.store.save_record(&next).await?;
                        next
                    }
                }
            }
            Action::Resume(snapshot) => {
                let Some(current) = self.reload(&snapshot).await? else {
                    return Ok(());
                };
                if current.state == BootstrapState::Failed {
                    info!(
                        "Instance {}: retrying from {} (error count {})",
                        current.instance_id,
                        current.failed_step.unwrap_or_default(),
                        current.error_count
                    );
                    let next = self.machine.resume(&current);
                    self.store.save_record(&next).await?;
                    next
                } else {
                    current
                }
            }
        };

        let record = self.drive(record, stop).await?;
        if record.state == BootstrapState::Removed {
            self.finish_teardown(record, stop).await?;
        }
        Ok(())
    }

    /// Advance until the record is stable or a stop is requested
    async fn drive(&self, mut record: InstanceRecord, stop: &AtomicBool) -> Result<InstanceRecord, ControllerError> {
        while !record.state.is_stable() {
            if stop.load(Ordering::SeqCst) {
                info!(
                    "Instance {}: stopping at {} as requested",
                    record.instance_id, record.state
                );
                break;
            }
            let next = self.machine.advance(&record).await;
            if next != record {
                self.store.save_record(&next).await?;
            }
            let retrying = next.state == record.state && next.step_attempts > record.step_attempts;
            if retrying {
                let delay = self.step_retry.delay_for(next.step_attempts.saturating_sub(1));
                debug!(
                    "Instance {}: retrying {} in {:?}",
                    next.instance_id, next.state, delay
                );
                tokio::time::sleep(delay).await;
            }
            record = next;
        }
        Ok(record)
    }

    async fn finish_teardown(&self, record: InstanceRecord, stop: &AtomicBool) -> Result<(), ControllerError> {
        match record.intent {
            Intent::Remove => {
                // A failed terminate is retried from the Removed record next pass
                self.lifecycle
                    .terminate(&record.instance_id, record.provider_id.as_deref())
                    .await?;
                self.store.delete_record(&record.instance_id).await?;
                info!("Instance {}: removed and released", record.instance_id);
            }
            Intent::Reconfigure => {
                let mut next = self.machine.restart(&record);
                if let Some(desired) = self.store.get_desired(&record.instance_id).await? {
                    next.apply_spec(&desired.spec);
                }
                self.store.save_record(&next).await?;
                self.drive(next, stop).await?;
            }
            Intent::Join => {
                warn!(
                    "Instance {}: removed without a teardown intent",
                    record.instance_id
                );
            }
        }
        Ok(())
    }

    /// Latest stored version of the record the action was planned from
    async fn reload(&self, snapshot: &InstanceRecord) -> Result<Option<InstanceRecord>, ControllerError> {
        let current = self.store.get_record(&snapshot.instance_id).await?;
        if current.is_none() {
            debug!("Instance {}: record is gone", snapshot.instance_id);
        }
        Ok(current)
    }
}
