//! Template Renderer
//!
//! Turns a [`KernelTemplateSpec`] plus a [`KernelConnectionConfig`] into the
//! concrete pod the kernel runs in. Rendering is pure: the same inputs always
//! produce a byte-identical [`RenderedWorkload`], including its content hash.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use super::error::TemplateError;
use super::validate::{validate_connection, validate_template};
use crate::crd::{KernelConnectionConfig, KernelTemplateSpec, KernelTransport};
use crate::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, OWNER_NAME_LABEL, TEMPLATE_HASH_ANNOTATION};

/// Prefix shared by every injected environment variable
pub const KERNEL_ENV_PREFIX: &str = "KERNEL_";

/// Restart policy applied when the template leaves it unset
pub const DEFAULT_RESTART_POLICY: &str = "Never";

/// Suffix appended to the KernelManager name to form the pod name
const WORKLOAD_SUFFIX: &str = "-kernel";

/// Maximum length of a label value
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Maximum length of an object name
const MAX_OBJECT_NAME_LEN: usize = 253;

/// Rendered, not yet bound, kernel workload
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedWorkload {
    /// Labels from the template
    pub labels: BTreeMap<String, String>,
    /// Annotations from the template
    pub annotations: BTreeMap<String, String>,
    /// Pod spec with connection parameters injected
    pub spec: PodSpec,
    /// Content hash of `spec`
    pub hash: String,
}

impl RenderedWorkload {
    /// Labels the bound pod must carry
    pub fn desired_labels(&self, owner_name: &str) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(OWNER_NAME_LABEL.to_string(), owner_label_value(owner_name));
        labels
    }

    /// Annotations the bound pod must carry
    pub fn desired_annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = self.annotations.clone();
        annotations.insert(TEMPLATE_HASH_ANNOTATION.to_string(), self.hash.clone());
        annotations
    }

    /// Bind the rendered workload to a concrete pod owned by `owner`
    pub fn into_pod(
        self,
        name: &str,
        namespace: &str,
        owner_name: &str,
        owner: OwnerReference,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(self.desired_labels(owner_name)),
                annotations: Some(self.desired_annotations()),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(self.spec),
            status: None,
        }
    }
}

/// Name of the pod owned by the KernelManager `km_name`
pub fn workload_name(km_name: &str) -> String {
    let stem = bounded(km_name, MAX_OBJECT_NAME_LEN - WORKLOAD_SUFFIX.len());
    format!("{stem}{WORKLOAD_SUFFIX}")
}

/// Value of the owner-name label for the KernelManager `km_name`
///
/// Names longer than a label value allows are truncated and suffixed with a
/// hash of the full name, so distinct owners keep distinct selectors.
pub fn owner_label_value(km_name: &str) -> String {
    bounded(km_name, MAX_LABEL_VALUE_LEN)
}

/// `value` unchanged if it fits in `max` chars, otherwise a truncated prefix
/// joined to its [`deterministic_hash`]. The result always ends alphanumeric.
fn bounded(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let hash = deterministic_hash(value);
    let keep = max.saturating_sub(hash.len() + 1);
    let prefix: String = value.chars().take(keep).collect();
    let prefix = prefix.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    if prefix.is_empty() {
        hash
    } else {
        format!("{prefix}-{hash}")
    }
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so the value is stable across toolchains and safe to
/// persist in annotations.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Render the kernel workload
///
/// Validates both inputs, injects connection parameters into the first
/// container and defaults the restart policy. Injected values win over
/// template entries of the same name.
pub fn render(
    template: &KernelTemplateSpec,
    connection: &KernelConnectionConfig,
) -> Result<RenderedWorkload, TemplateError> {
    validate_template(&template.spec)?;
    validate_connection(connection)?;

    let mut spec = template.spec.clone();
    if spec.restart_policy.is_none() {
        spec.restart_policy = Some(DEFAULT_RESTART_POLICY.to_string());
    }
    if let Some(kernel) = spec.containers.first_mut() {
        inject_env(kernel, connection);
        if connection.transport == KernelTransport::Tcp {
            inject_ports(kernel, connection);
        }
    }

    let serialized =
        serde_json::to_string(&spec).map_err(|e| TemplateError::Serialization(e.to_string()))?;

    Ok(RenderedWorkload {
        labels: template.metadata.labels.clone(),
        annotations: template.metadata.annotations.clone(),
        hash: deterministic_hash(&serialized),
        spec,
    })
}

/// Environment variables describing the connection, in a fixed order
pub fn connection_env(connection: &KernelConnectionConfig) -> Vec<EnvVar> {
    let mut vars = vec![
        ("IP", connection.ip.clone()),
        ("TRANSPORT", connection.transport.to_string()),
        ("SHELL_PORT", connection.shell_port.to_string()),
        ("IOPUB_PORT", connection.iopub_port.to_string()),
        ("STDIN_PORT", connection.stdin_port.to_string()),
        ("CONTROL_PORT", connection.control_port.to_string()),
        ("HB_PORT", connection.hb_port.to_string()),
        ("SIGNATURE_SCHEME", connection.signature_scheme.clone()),
    ];
    if let Some(key) = &connection.key {
        vars.push(("KEY", key.clone()));
    }
    if let Some(kernel_name) = &connection.kernel_name {
        vars.push(("NAME", kernel_name.clone()));
    }

    vars.into_iter()
        .map(|(suffix, value)| EnvVar {
            name: format!("{KERNEL_ENV_PREFIX}{suffix}"),
            value: Some(value),
            value_from: None,
        })
        .collect()
}

fn inject_env(container: &mut Container, connection: &KernelConnectionConfig) {
    let injected = connection_env(connection);
    let mut env = container.env.take().unwrap_or_default();
    env.retain(|var| !injected.iter().any(|i| i.name == var.name));
    env.extend(injected);
    container.env = Some(env);
}

fn inject_ports(container: &mut Container, connection: &KernelConnectionConfig) {
    let injected: Vec<ContainerPort> = connection
        .named_ports()
        .into_iter()
        .map(|(name, port)| ContainerPort {
            name: Some(name.to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let mut ports = container.ports.take().unwrap_or_default();
    ports.retain(|p| {
        !injected
            .iter()
            .any(|i| i.container_port == p.container_port || (p.name.is_some() && i.name == p.name))
    });
    ports.extend(injected);
    container.ports = Some(ports);
}
