//! Kernel pod rendering
//!
//! [`render`] is a pure function from the KernelManager spec to a
//! [`RenderedWorkload`]; [`RenderedWorkload::into_pod`] binds it to a named,
//! owned Pod. Nothing here talks to the API server.

mod error;
mod renderer;
mod validate;

pub use error::TemplateError;
pub use renderer::{
    connection_env, deterministic_hash, owner_label_value, render, workload_name, RenderedWorkload,
    DEFAULT_RESTART_POLICY, KERNEL_ENV_PREFIX,
};
pub use validate::{validate_connection, validate_template};
