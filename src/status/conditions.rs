//! Condition Tracker
//!
//! Keeps an ordered history with at most one condition per type. Order is the
//! order in which types were first seen; dedup is a linear scan since a
//! KernelManager only ever carries a handful of condition types.

use chrono::{DateTime, Utc};

use crate::crd::{Condition, ConditionStatus};

/// Condition types written by the reconciler
pub mod types {
    /// The owned pod has been created
    pub const WORKLOAD_CREATED: &str = "WorkloadCreated";
    /// The kernel pod reports ready
    pub const READY: &str = "Ready";
    /// The KernelManager hit a terminal error
    pub const FAILED: &str = "Failed";
    /// Deletion requested
    pub const TERMINATING: &str = "Terminating";
}

/// Machine-readable condition reasons
pub mod reasons {
    /// Pod exists
    pub const POD_CREATED: &str = "PodCreated";
    /// Pod reports Ready=True
    pub const POD_READY: &str = "PodReady";
    /// Pod exists but is not ready
    pub const POD_NOT_READY: &str = "PodNotReady";
    /// Pod vanished and is being recreated
    pub const POD_MISSING: &str = "PodMissing";
    /// Template or connection config is invalid
    pub const VALIDATION_ERROR: &str = "ValidationError";
    /// The platform rejected the rendered pod
    pub const UNRECOVERABLE_CREATE_ERROR: &str = "UnrecoverableCreateError";
    /// Transient errors persisted past the retry budget
    pub const RETRY_BUDGET_EXHAUSTED: &str = "RetryBudgetExhausted";
    /// The kernel pod itself failed
    pub const POD_FAILED: &str = "PodFailed";
    /// A previous failure no longer applies
    pub const RECOVERED: &str = "Recovered";
    /// Deletion timestamp observed
    pub const DELETION_REQUESTED: &str = "DeletionRequested";
}

/// Insert or update `new` using the current time
pub fn upsert(conditions: Vec<Condition>, new: Condition) -> Vec<Condition> {
    upsert_at(conditions, new, Utc::now())
}

/// Insert or update `new`, stamping with `now`.
///
/// An existing entry of the same type takes the new status, reason and
/// message. Its probe time always moves to `now`; its transition time moves
/// only when the status changed. A new type is appended with both timestamps
/// set to `now`. The timestamps carried by `new` are ignored.
pub fn upsert_at(
    mut conditions: Vec<Condition>,
    new: Condition,
    now: DateTime<Utc>,
) -> Vec<Condition> {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status {
                existing.last_transition_time = now;
            }
            existing.status = new.status;
            existing.reason = new.reason;
            existing.message = new.message;
            existing.last_probe_time = now;
        }
        None => conditions.push(Condition {
            last_probe_time: now,
            last_transition_time: now,
            ..new
        }),
    }
    conditions
}

/// Look up a condition by type
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True when a condition of `type_` exists with status `True`
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}
