//! Bounded, per-instance exclusive execution of reconcile actions.
//!
//! At most one action runs per instance; a second action for a busy instance
//! is coalesced into the running one. A `Delete` coalesced onto a forward run
//! asks that run to stop at its next step boundary. Overall parallelism is
//! capped by a semaphore.

use crate::reconciler::{Action, ActionKind, Worker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info};

/// Result of handing an action to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A worker was started for the action
    Started,
    /// The instance already has an action in flight
    Coalesced,
    /// Nothing to run
    Skipped,
}

struct InFlight {
    kind: ActionKind,
    stop: Arc<AtomicBool>,
}

/// Schedules actions onto workers
pub struct Dispatcher {
    worker: Arc<Worker>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    completed: Arc<Notify>,
    trigger: Arc<Notify>,
}

impl Dispatcher {
    /// Create a dispatcher running at most `max_concurrent` actions at once
    ///
    /// `trigger` is notified whenever an action completes, so the controller
    /// can plan the instance's next step without waiting for its timer.
    pub fn new(worker: Arc<Worker>, max_concurrent: usize, trigger: Arc<Notify>) -> Self {
        Self {
            worker,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            completed: Arc::new(Notify::new()),
            trigger,
        }
    }

    /// Start `action` unless its instance is busy
    pub fn dispatch(&self, action: Action) -> DispatchOutcome {
        if action.kind() == ActionKind::NoOp {
            return DispatchOutcome::Skipped;
        }
        let instance_id = action.instance_id().to_string();

        let stop = {
            let mut in_flight = lock(&self.in_flight);
            if let Some(running) = in_flight.get(&instance_id) {
                if action.kind() == ActionKind::Delete && running.kind != ActionKind::Delete {
                    info!(
                        "Instance {}: delete requested during {:?}, stopping at the next step",
                        instance_id, running.kind
                    );
                    running.stop.store(true, Ordering::SeqCst);
                } else {
                    debug!("Instance {}: {:?} coalesced", instance_id, action.kind());
                }
                return DispatchOutcome::Coalesced;
            }
            let stop = Arc::new(AtomicBool::new(false));
            in_flight.insert(
                instance_id.clone(),
                InFlight {
                    kind: action.kind(),
                    stop: Arc::clone(&stop),
                },
            );
            stop
        };

        let guard = InFlightGuard {
            instance_id,
            in_flight: Arc::clone(&self.in_flight),
            completed: Arc::clone(&self.completed),
            trigger: Arc::clone(&self.trigger),
        };
        let worker = Arc::clone(&self.worker);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            worker.run(action, stop).await;
        });
        DispatchOutcome::Started
    }

    /// Number of instances with an action in flight
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Wait until no action is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.completed.notified();
            if self.in_flight_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Removes the in-flight entry when the task ends, even if the worker panics
struct InFlightGuard {
    instance_id: String,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    completed: Arc<Notify>,
    trigger: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.instance_id);
        self.completed.notify_waiters();
        self.trigger.notify_one();
    }
}

fn lock(map: &Mutex<HashMap<String, InFlight>>) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
    map.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
