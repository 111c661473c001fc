//! Desired-versus-observed comparison
//!
//! [`plan`] looks at the rendered workload and every owned pod and picks at
//! most one corrective action. Platform-populated pod fields are never
//! compared directly: the spec is matched through the template-hash
//! annotation and metadata through a subset check.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::status::pod_phase;
use crate::template::RenderedWorkload;
use crate::TEMPLATE_HASH_ANNOTATION;

/// Why a pod is being deleted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteReason {
    /// Pod spec drifted from the template; pods are immutable so it is replaced
    Recreate,
    /// Kernel exited successfully and must be started again
    Completed,
    /// More than one owned pod exists
    Duplicate,
    /// The KernelManager is being deleted
    Teardown,
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recreate => write!(f, "Recreate"),
            Self::Completed => write!(f, "Completed"),
            Self::Duplicate => write!(f, "Duplicate"),
            Self::Teardown => write!(f, "Teardown"),
        }
    }
}

/// The single mutation a reconcile pass may issue
#[derive(Clone, Debug, PartialEq)]
pub enum CorrectiveAction {
    /// Create the kernel pod
    Create {
        /// Pod name
        name: String,
    },
    /// Patch labels and annotations in place
    UpdateMetadata {
        /// Pod name
        name: String,
        /// Labels to merge
        labels: BTreeMap<String, String>,
        /// Annotations to merge
        annotations: BTreeMap<String, String>,
    },
    /// Delete a pod
    Delete {
        /// Pod name
        name: String,
        /// Why
        reason: DeleteReason,
    },
}

impl CorrectiveAction {
    /// Name of the pod the action targets
    pub fn pod_name(&self) -> &str {
        match self {
            Self::Create { name } | Self::UpdateMetadata { name, .. } | Self::Delete { name, .. } => {
                name
            }
        }
    }
}

impl fmt::Display for CorrectiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { name } => write!(f, "Create({name})"),
            Self::UpdateMetadata { name, .. } => write!(f, "UpdateMetadata({name})"),
            Self::Delete { name, reason } => write!(f, "Delete({name}, {reason})"),
        }
    }
}

/// Outcome of comparing desired and observed state
#[derive(Clone, Debug, PartialEq)]
pub enum Plan {
    /// Observed matches desired
    Converged,
    /// A pod is already terminating; nothing to do until it is gone
    Wait,
    /// Issue this action
    Act(CorrectiveAction),
}

/// True when the pod has a deletion timestamp
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Pick the pod that represents the kernel: the one with the desired name if
/// present and live, else the first live one, else the first one
pub fn primary_pod<'a>(pods: &'a [Pod], desired_name: &str) -> Option<&'a Pod> {
    pods.iter()
        .find(|p| p.name_any() == desired_name && !is_terminating(p))
        .or_else(|| pods.iter().find(|p| !is_terminating(p)))
        .or_else(|| pods.first())
}

fn is_subset(want: &BTreeMap<String, String>, have: &BTreeMap<String, String>) -> bool {
    want.iter().all(|(k, v)| have.get(k) == Some(v))
}

/// Decide the next corrective action
pub fn plan(
    desired: &RenderedWorkload,
    owner_name: &str,
    desired_name: &str,
    observed: &[Pod],
) -> Plan {
    let Some(primary) = primary_pod(observed, desired_name) else {
        return Plan::Act(CorrectiveAction::Create {
            name: desired_name.to_string(),
        });
    };

    if observed.len() > 1 {
        let extra = observed
            .iter()
            .filter(|p| !std::ptr::eq(*p, primary))
            .find(|p| !is_terminating(p));
        if let Some(extra) = extra {
            return Plan::Act(CorrectiveAction::Delete {
                name: extra.name_any(),
                reason: DeleteReason::Duplicate,
            });
        }
    }

    if is_terminating(primary) {
        return Plan::Wait;
    }

    if pod_phase(primary) == Some("Succeeded") {
        return Plan::Act(CorrectiveAction::Delete {
            name: primary.name_any(),
            reason: DeleteReason::Completed,
        });
    }

    let observed_hash = primary.annotations().get(TEMPLATE_HASH_ANNOTATION);
    if observed_hash != Some(&desired.hash) {
        return Plan::Act(CorrectiveAction::Delete {
            name: primary.name_any(),
            reason: DeleteReason::Recreate,
        });
    }

    let labels = desired.desired_labels(owner_name);
    let annotations = desired.desired_annotations();
    if !is_subset(&labels, primary.labels()) || !is_subset(&annotations, primary.annotations()) {
        return Plan::Act(CorrectiveAction::UpdateMetadata {
            name: primary.name_any(),
            labels,
            annotations,
        });
    }

    Plan::Converged
}
