//! Fleet reconciliation planning.
//!
//! [`reconcile`] compares the desired set with the existing records and
//! decides one action per instance. It performs no I/O; the dispatcher
//! executes the actions.

use crate::backoff::BackoffPolicy;
use crate::fingerprint::VersionTracker;
use crate::store::DesiredInstance;
use chrono::{DateTime, Utc};
use crds::{BootstrapState, InstanceRecord};
use std::collections::{BTreeMap, BTreeSet};

mod worker;
pub use worker::Worker;

/// Work to do for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create the record and join the instance
    Create(DesiredInstance),
    /// Tear the instance down and join it again at the current configuration
    Reconfigure(InstanceRecord),
    /// Tear the instance down and release it
    Delete(InstanceRecord),
    /// Continue (or retry) the instance's run
    Resume(InstanceRecord),
    /// Nothing to do
    NoOp(InstanceRecord),
}

/// Discriminant of an [`Action`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// See [`Action::Create`]
    Create,
    /// See [`Action::Reconfigure`]
    Reconfigure,
    /// See [`Action::Delete`]
    Delete,
    /// See [`Action::Resume`]
    Resume,
    /// See [`Action::NoOp`]
    NoOp,
}

impl Action {
    /// Instance the action is about
    pub fn instance_id(&self) -> &str {
        match self {
            Action::Create(desired) => &desired.id,
            Action::Reconfigure(record)
            | Action::Delete(record)
            | Action::Resume(record)
            | Action::NoOp(record) => &record.instance_id,
        }
    }

    /// Discriminant
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create(_) => ActionKind::Create,
            Action::Reconfigure(_) => ActionKind::Reconfigure,
            Action::Delete(_) => ActionKind::Delete,
            Action::Resume(_) => ActionKind::Resume,
            Action::NoOp(_) => ActionKind::NoOp,
        }
    }
}

/// Decide one action per instance, ordered by instance id
pub fn reconcile(
    desired: &[DesiredInstance],
    actual: &[InstanceRecord],
    tracker: &VersionTracker,
    retry: &BackoffPolicy,
    now: DateTime<Utc>,
) -> Vec<Action> {
    let desired_by_id: BTreeMap<&str, &DesiredInstance> =
        desired.iter().map(|d| (d.id.as_str(), d)).collect();
    let records_by_id: BTreeMap<&str, &InstanceRecord> =
        actual.iter().map(|r| (r.instance_id.as_str(), r)).collect();
    let ids: BTreeSet<&str> = desired_by_id
        .keys()
        .chain(records_by_id.keys())
        .copied()
        .collect();

    ids.into_iter()
        .filter_map(|id| match (desired_by_id.get(id), records_by_id.get(id)) {
            (Some(desired), None) => Some(Action::Create((*desired).clone())),
            (None, Some(record)) => Some(Action::Delete((*record).clone())),
            (Some(desired), Some(record)) => Some(plan_matched(desired, record, tracker, retry, now)),
            (None, None) => None,
        })
        .collect()
}

fn plan_matched(
    desired: &DesiredInstance,
    record: &InstanceRecord,
    tracker: &VersionTracker,
    retry: &BackoffPolicy,
    now: DateTime<Utc>,
) -> Action {
    let record_action = |make: fn(InstanceRecord) -> Action| make(record.clone());
    match record.state {
        BootstrapState::Ready if tracker.is_stale(record) || !record.matches_node_config(&desired.spec) => {
            record_action(Action::Reconfigure)
        }
        BootstrapState::Ready => record_action(Action::NoOp),
        BootstrapState::Failed if record.non_retryable => {
            if record.target_fingerprint.as_deref() == Some(tracker.current_fingerprint()) {
                record_action(Action::NoOp)
            } else {
                record_action(Action::Resume)
            }
        }
        BootstrapState::Failed => {
            let delay = retry.delay_for(record.error_count.saturating_sub(1));
            let retry_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| record.last_transition.checked_add_signed(d));
            match retry_at {
                Some(at) if now < at => record_action(Action::NoOp),
                _ => record_action(Action::Resume),
            }
        }
        // Intermediate states (including a teardown in progress) continue
        _ => record_action(Action::Resume),
    }
}
