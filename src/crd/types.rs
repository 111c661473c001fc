//! Supporting types for the KernelManager CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodSpec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Desired state
// =============================================================================

/// Metadata copied onto the kernel pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TemplateMetadata {
    /// Labels applied to the pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations applied to the pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Desired shape of the kernel workload
///
/// The first container of `spec` is the kernel container; connection
/// parameters are injected into it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct KernelTemplateSpec {
    /// Pod metadata
    #[serde(default)]
    pub metadata: TemplateMetadata,

    /// Pod spec
    pub spec: PodSpec,
}

/// Transport used by the kernel's messaging sockets
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KernelTransport {
    /// TCP sockets bound on `ip`
    #[default]
    Tcp,
    /// IPC sockets (no container ports are exposed)
    Ipc,
}

impl std::fmt::Display for KernelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Ipc => write!(f, "ipc"),
        }
    }
}

/// Connection parameters the running kernel must expose
///
/// Fixed-shape record with no nested ownership; it is copied by value into
/// the rendered pod and never interpreted by the controller beyond range checks.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KernelConnectionConfig {
    /// Address the kernel binds its sockets on
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Socket transport
    #[serde(default)]
    pub transport: KernelTransport,

    /// Shell channel port
    pub shell_port: i32,

    /// IOPub channel port
    pub iopub_port: i32,

    /// Stdin channel port
    pub stdin_port: i32,

    /// Control channel port
    pub control_port: i32,

    /// Heartbeat port
    pub hb_port: i32,

    /// Message signing scheme (e.g., "hmac-sha256")
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,

    /// Message signing key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Kernel spec name (e.g., "python3")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_signature_scheme() -> String {
    "hmac-sha256".to_string()
}

impl KernelConnectionConfig {
    /// Named channel ports in a fixed order: shell, iopub, stdin, control, hb
    pub fn named_ports(&self) -> [(&'static str, i32); 5] {
        [
            ("shell", self.shell_port),
            ("iopub", self.iopub_port),
            ("stdin", self.stdin_port),
            ("control", self.control_port),
            ("hb", self.hb_port),
        ]
    }
}

// =============================================================================
// Observed state
// =============================================================================

/// Coarse lifecycle phase of a KernelManager
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum KernelManagerPhase {
    /// Workload not yet observed or still starting
    #[default]
    Pending,
    /// Workload observed healthy and connection-ready
    Running,
    /// Workload failed or the resource hit a terminal error
    Failed,
    /// Deletion requested, cleanup in progress
    Terminating,
}

impl std::fmt::Display for KernelManagerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Failed => write!(f, "Failed"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Ready, Failed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition was observed
    pub last_probe_time: DateTime<Utc>,

    /// Last time the condition's status changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with both timestamps set to now
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::observed_at(type_, status, reason, message, Utc::now())
    }

    /// Create a new condition with both timestamps set to `now`
    pub fn observed_at(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_probe_time: now,
            last_transition_time: now,
        }
    }

    /// True when the condition has status `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Runtime state of the kernel container
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ContainerRuntimeState {
    /// Container has not started (pulling, creating, crash backoff)
    Waiting,
    /// Container is running
    Running,
    /// Container exited
    Terminated,
    /// No container status observed
    #[default]
    Unknown,
}

/// Summary of the kernel container in the single owned pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// Current runtime state
    #[serde(default)]
    pub state: ContainerRuntimeState,

    /// Reason reported for the current state (e.g., ImagePullBackOff)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Message reported for the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Exit code when terminated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Whether the container passes its readiness checks
    #[serde(default)]
    pub ready: bool,

    /// Number of container restarts
    #[serde(default)]
    pub restart_count: i32,

    /// When the current run started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Reason of the previous termination, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_termination_reason: Option<String>,
}
