//! KernelManager Custom Resource Definition
//!
//! A KernelManager declares one long-running compute kernel: the pod template
//! it runs in and the connection parameters clients use to reach it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, ContainerState, KernelConnectionConfig, KernelManagerPhase, KernelTemplateSpec,
};

/// Desired state of a KernelManager
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kernelmanager.io",
    version = "v1",
    kind = "KernelManager",
    plural = "kernelmanagers",
    shortname = "km",
    status = "KernelManagerStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".status.workloadName"}"#,
    printcolumn = r#"{"name":"Kernel","type":"string","jsonPath":".spec.connectionConfig.kernelName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KernelManagerSpec {
    /// Pod template the kernel runs in
    pub template: KernelTemplateSpec,

    /// Connection parameters injected into the kernel container
    pub connection_config: KernelConnectionConfig,
}

/// Status for a KernelManager
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KernelManagerStatus {
    /// Coarse lifecycle phase
    #[serde(default)]
    pub phase: KernelManagerPhase,

    /// Condition history, at most one entry per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Summary of the kernel container in the owned pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_state: Option<ContainerState>,

    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name of the owned pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_name: Option<String>,
}

impl KernelManagerStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: KernelManagerPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Replace the condition history and return self for chaining
    pub fn conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Set the container summary and return self for chaining
    pub fn container_state(mut self, state: Option<ContainerState>) -> Self {
        self.container_state = state;
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Set the workload name and return self for chaining
    pub fn workload_name(mut self, name: Option<String>) -> Self {
        self.workload_name = name;
        self
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Equality that ignores `lastProbeTime`.
    ///
    /// Probe timestamps advance on every pass; writing status only because of
    /// them would turn every reconcile into a watch event.
    pub fn semantically_eq(&self, other: &Self) -> bool {
        self.phase == other.phase
            && self.container_state == other.container_state
            && self.observed_generation == other.observed_generation
            && self.workload_name == other.workload_name
            && self.conditions.len() == other.conditions.len()
            && self.conditions.iter().zip(&other.conditions).all(|(a, b)| {
                a.type_ == b.type_
                    && a.status == b.status
                    && a.reason == b.reason
                    && a.message == b.message
                    && a.last_transition_time == b.last_transition_time
            })
    }
}
