//! Reconciliation for KernelManager resources
//!
//! The controller follows the observe-diff-act loop: [`store`] abstracts the
//! API server, [`diff`] decides the single corrective action, and
//! [`kernel_manager`] runs the pass and publishes status.

pub mod diff;
pub mod kernel_manager;
mod locks;
pub mod store;

pub use diff::{plan, CorrectiveAction, DeleteReason, Plan};
pub use kernel_manager::{
    error_policy, object_key, reconcile, reconcile_key, Context, ReconcileOutcome,
};
pub use locks::KeyLocks;
pub use store::{is_owned_by, KernelStore, KubeStore, Page, KIND_KERNEL_MANAGER, KIND_POD};
