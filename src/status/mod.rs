//! Condition tracking and phase aggregation
//!
//! Both halves are pure functions over plain data; the reconciler owns the
//! clock and the store.

mod aggregate;
pub mod conditions;

pub use aggregate::{aggregate, pod_failed, pod_phase, pod_ready, ObservedWorkload};
pub use conditions::{find, is_true, reasons, types, upsert, upsert_at};
