//! Custom Resource Definitions for the KernelManager operator

mod kernel_manager;
mod types;

pub use kernel_manager::{KernelManager, KernelManagerSpec, KernelManagerStatus};
pub use types::{
    Condition, ConditionStatus, ContainerRuntimeState, ContainerState, KernelConnectionConfig,
    KernelManagerPhase, KernelTemplateSpec, KernelTransport, TemplateMetadata,
};
