//! KernelManager - CRD-driven Kubernetes operator for interactive compute kernels
//!
//! Every `KernelManager` resource declares one long-running kernel: a pod
//! template plus the connection parameters clients use to reach it. The
//! operator materializes exactly one owned Pod per resource, keeps it converged
//! with the declared template, and publishes a condition history and a coarse
//! phase on the resource status.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definition (KernelManager) and status types
//! - [`template`] - Pure rendering of the kernel pod from template + connection
//! - [`status`] - Condition tracking and phase aggregation
//! - [`controller`] - Reconciliation loop, resource store abstraction, backoff
//! - [`config`] - Controller configuration (CLI flags / environment)
//! - [`retry`] - Exponential backoff with jitter
//! - [`telemetry`] - Structured logging setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod retry;
pub mod status;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared Constants
// =============================================================================

/// Finalizer guarding removal of a KernelManager until its pod is gone
pub const FINALIZER: &str = "kernelmanager.io/finalizer";

/// Field manager used for every write issued by the controller
pub const FIELD_MANAGER: &str = "kernel-manager";

/// Label carrying the name of the owning KernelManager
pub const OWNER_NAME_LABEL: &str = "kernelmanager.io/name";

/// Standard managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on kernel pods
pub const MANAGED_BY_VALUE: &str = "kernel-manager";

/// Annotation holding the content hash of the rendered pod spec
pub const TEMPLATE_HASH_ANNOTATION: &str = "kernelmanager.io/template-hash";
