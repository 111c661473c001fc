//! Status Aggregator
//!
//! Folds the condition history and the observed pod into one coarse phase
//! plus a container summary. Unknown or partial observations map to
//! `Pending`; nothing here fails.

use k8s_openapi::api::core::v1::{ContainerState as PodContainerState, ContainerStatus, Pod};

use super::conditions::{is_true, types};
use crate::crd::{Condition, ContainerRuntimeState, ContainerState, KernelManagerPhase};

/// Observed state of the owned workload for one pass
#[derive(Clone, Copy, Debug, Default)]
pub struct ObservedWorkload<'a> {
    /// The KernelManager carries a deletion timestamp
    pub deletion_requested: bool,
    /// The single owned pod, if any
    pub pod: Option<&'a Pod>,
}

impl<'a> ObservedWorkload<'a> {
    /// Observation of a live resource with the given pod
    pub fn with_pod(pod: Option<&'a Pod>) -> Self {
        Self {
            deletion_requested: false,
            pod,
        }
    }
}

/// Derive the phase and container summary.
///
/// Precedence, highest first: Failed, Terminating, Pending, Running.
pub fn aggregate(
    conditions: &[Condition],
    observed: &ObservedWorkload<'_>,
) -> (KernelManagerPhase, Option<ContainerState>) {
    let container_state = observed.pod.and_then(summarize_kernel_container);

    let phase = if is_true(conditions, types::FAILED)
        || observed.pod.is_some_and(pod_failed)
    {
        KernelManagerPhase::Failed
    } else if observed.deletion_requested {
        KernelManagerPhase::Terminating
    } else if observed.pod.is_some_and(pod_running_and_ready) {
        KernelManagerPhase::Running
    } else {
        KernelManagerPhase::Pending
    };

    (phase, container_state)
}

/// Pod phase as reported by the kubelet
pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// True when the pod condition `Ready` is `True`
pub fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// True when the kernel pod should be considered failed
///
/// Either the kubelet marked the pod `Failed`, or the kernel container exited
/// non-zero with no restart coming.
pub fn pod_failed(pod: &Pod) -> bool {
    if pod_phase(pod) == Some("Failed") {
        return true;
    }
    let never_restarts = pod
        .spec
        .as_ref()
        .and_then(|s| s.restart_policy.as_deref())
        == Some("Never");
    never_restarts
        && kernel_container_status(pod)
            .and_then(|cs| cs.state.as_ref())
            .and_then(|s| s.terminated.as_ref())
            .is_some_and(|t| t.exit_code != 0)
}

fn pod_running_and_ready(pod: &Pod) -> bool {
    pod_phase(pod) == Some("Running") && pod_ready(pod)
}

/// Status of the kernel container: matched by the first spec container's
/// name, falling back to the first reported status
fn kernel_container_status(pod: &Pod) -> Option<&ContainerStatus> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    let kernel_name = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.as_str());

    kernel_name
        .and_then(|name| statuses.iter().find(|cs| cs.name == name))
        .or_else(|| statuses.first())
}

fn summarize_kernel_container(pod: &Pod) -> Option<ContainerState> {
    let cs = kernel_container_status(pod)?;
    let mut summary = ContainerState {
        ready: cs.ready,
        restart_count: cs.restart_count,
        last_termination_reason: cs
            .last_state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
            .and_then(|t| t.reason.clone()),
        ..Default::default()
    };

    match cs.state.as_ref() {
        Some(PodContainerState {
            running: Some(running),
            ..
        }) => {
            summary.state = ContainerRuntimeState::Running;
            summary.started_at = running.started_at.as_ref().map(|t| t.0);
        }
        Some(PodContainerState {
            terminated: Some(terminated),
            ..
        }) => {
            summary.state = ContainerRuntimeState::Terminated;
            summary.exit_code = Some(terminated.exit_code);
            summary.reason = terminated.reason.clone();
            summary.message = terminated.message.clone();
            summary.started_at = terminated.started_at.as_ref().map(|t| t.0);
        }
        Some(PodContainerState {
            waiting: Some(waiting),
            ..
        }) => {
            summary.state = ContainerRuntimeState::Waiting;
            summary.reason = waiting.reason.clone();
            summary.message = waiting.message.clone();
        }
        _ => summary.state = ContainerRuntimeState::Unknown,
    }

    Some(summary)
}
