//! KernelManager controller implementation
//!
//! One pass: load the resource and its pods, render the desired pod, issue at
//! most one corrective action, then rebuild status from scratch and write it
//! back with an optimistic-concurrency replace. Long convergence spans passes
//! through requeues; a pass never waits on the cluster.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::diff::{is_terminating, plan, primary_pod, CorrectiveAction, DeleteReason, Plan};
use super::locks::KeyLocks;
use super::store::{KernelStore, KubeStore, KIND_KERNEL_MANAGER};
use crate::config::ControllerConfig;
use crate::crd::{
    Condition, ConditionStatus, KernelManager, KernelManagerPhase, KernelManagerStatus,
};
use crate::error::ErrorClass;
use crate::retry::BackoffTracker;
use crate::status::{aggregate, conditions, pod_failed, pod_ready, reasons, types, ObservedWorkload};
use crate::template::{render, workload_name, RenderedWorkload};
use crate::{Error, FINALIZER};

/// Controller context shared by every reconcile
pub struct Context {
    /// Resource store (trait object for testability)
    pub store: Arc<dyn KernelStore>,
    /// Runtime configuration
    pub config: ControllerConfig,
    /// Consecutive transient failures per key
    pub backoff: BackoffTracker,
    /// Per-key single-flight locks
    pub locks: KeyLocks,
}

impl Context {
    /// Create a context around any store
    pub fn new(store: Arc<dyn KernelStore>, config: ControllerConfig) -> Self {
        let backoff = BackoffTracker::new(config.retry.clone(), config.retry_budget);
        Self {
            store,
            config,
            backoff,
            locks: KeyLocks::new(),
        }
    }

    /// Create a context backed by the Kubernetes API
    pub fn from_client(client: Client, config: ControllerConfig) -> Self {
        Self::new(Arc::new(KubeStore::new(client)), config)
    }
}

/// Result of one reconcile pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// When to look at the resource again; `None` waits for the next change
    pub requeue_after: Option<Duration>,
    /// The corrective action issued, if any
    pub action: Option<CorrectiveAction>,
    /// Phase published by this pass
    pub phase: Option<KernelManagerPhase>,
    /// Whether the status subresource was written
    pub status_written: bool,
}

impl ReconcileOutcome {
    fn done() -> Self {
        Self::default()
    }

    /// Convert into the controller runtime's requeue decision
    pub fn into_action(self) -> Action {
        match self.requeue_after {
            Some(after) => Action::requeue(after),
            None => Action::await_change(),
        }
    }
}

/// Queue key of a KernelManager
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn has_finalizer(km: &KernelManager) -> bool {
    km.finalizers().iter().any(|f| f == FINALIZER)
}

/// Reconcile a KernelManager resource
///
/// Entry point for the kube-rs controller; the real work happens in
/// [`reconcile_key`], which re-reads the resource from the store.
#[instrument(
    skip(km, ctx),
    fields(
        kernel_manager = %km.name_any(),
        namespace = %km.namespace().unwrap_or_default(),
    )
)]
pub async fn reconcile(km: Arc<KernelManager>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = km.namespace().ok_or_else(|| {
        Error::internal_with_context("reconciler", "KernelManager has no namespace")
    })?;
    let outcome = reconcile_key(&namespace, &km.name_any(), &ctx).await?;
    Ok(outcome.into_action())
}

/// Run one reconcile pass for `namespace/name`
///
/// Passes for the same key are serialized. Retryable failures other than
/// conflicts are counted towards the key's retry budget.
pub async fn reconcile_key(
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<ReconcileOutcome, Error> {
    let key = object_key(namespace, name);
    let guard = ctx.locks.lock(&key).await;

    let result = Pass::new(namespace, name, &key, ctx).run().await;

    match &result {
        Ok(_) => {}
        Err(e) if e.is_retryable() && !e.is_conflict() => {
            ctx.backoff.record_failure(&key);
            debug!(
                error = %e,
                failures = ctx.backoff.failures(&key),
                "transient failure recorded"
            );
        }
        Err(_) => {}
    }

    drop(guard);
    if matches!(&result, Ok(o) if o == &ReconcileOutcome::done()) {
        ctx.locks.forget(&key);
    }
    result
}

/// Requeue policy for failed passes
///
/// Conflicts retry immediately, transient errors back off exponentially with
/// jitter, and anything else waits for the failed interval.
pub fn error_policy(km: Arc<KernelManager>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(&km.namespace().unwrap_or_default(), &km.name_any());

    if error.is_conflict() {
        debug!(kernel_manager = %key, "write conflict, requeueing immediately");
        return Action::requeue(Duration::ZERO);
    }

    if !error.is_retryable() {
        warn!(kernel_manager = %key, ?error, "reconciliation failed permanently");
        return Action::requeue(ctx.config.requeue.failed);
    }

    let delay = ctx.backoff.delay_for(&key);
    warn!(
        kernel_manager = %key,
        ?error,
        failures = ctx.backoff.failures(&key),
        delay_ms = delay.as_millis() as u64,
        "reconciliation failed, backing off"
    );
    Action::requeue(delay)
}

/// Terminal failure recorded on the Failed condition
struct Failure {
    reason: &'static str,
    message: String,
}

/// State of one reconcile pass
struct Pass<'a> {
    namespace: &'a str,
    name: &'a str,
    key: &'a str,
    ctx: &'a Context,
    now: DateTime<Utc>,
}

impl<'a> Pass<'a> {
    fn new(namespace: &'a str, name: &'a str, key: &'a str, ctx: &'a Context) -> Self {
        Self {
            namespace,
            name,
            key,
            ctx,
            now: Utc::now(),
        }
    }

    fn store(&self) -> &dyn KernelStore {
        self.ctx.store.as_ref()
    }

    async fn run(self) -> Result<ReconcileOutcome, Error> {
        match self.run_inner().await {
            Err(Error::Gone { kind, .. }) if kind == KIND_KERNEL_MANAGER => {
                debug!(kernel_manager = %self.key, "kernel manager deleted mid-pass");
                self.ctx.backoff.reset(self.key);
                Ok(ReconcileOutcome::done())
            }
            result => result,
        }
    }

    async fn run_inner(&self) -> Result<ReconcileOutcome, Error> {
        let Some(km) = self
            .store()
            .get_kernel_manager(self.namespace, self.name)
            .await?
        else {
            debug!(kernel_manager = %self.key, "kernel manager no longer exists");
            self.ctx.backoff.reset(self.key);
            return Ok(ReconcileOutcome::done());
        };

        if km.meta().deletion_timestamp.is_some() {
            return self.finalize(km).await;
        }

        let km = if has_finalizer(&km) {
            km
        } else {
            debug!(kernel_manager = %self.key, "adding finalizer");
            self.store()
                .add_finalizer(self.namespace, self.name, FINALIZER)
                .await?
        };

        let outcome = self.converge(&km).await?;
        self.ctx.backoff.reset(self.key);
        Ok(outcome)
    }

    async fn converge(&self, km: &KernelManager) -> Result<ReconcileOutcome, Error> {
        let uid = km.uid().ok_or_else(|| {
            Error::internal_with_context("reconciler", "KernelManager has no uid")
        })?;
        let pods = self
            .store()
            .list_owned_pods(self.namespace, self.name, &uid)
            .await?;
        let desired_name = workload_name(self.name);
        let prior = km.status.clone().unwrap_or_default();

        if self.ctx.backoff.is_exhausted(self.key) {
            warn!(
                kernel_manager = %self.key,
                failures = self.ctx.backoff.failures(self.key),
                "retry budget exhausted"
            );
            let failure = Failure {
                reason: reasons::RETRY_BUDGET_EXHAUSTED,
                message: format!(
                    "gave up after {} consecutive transient errors; edit the spec to retry",
                    self.ctx.backoff.failures(self.key)
                ),
            };
            let observed = primary_pod(&pods, &desired_name).filter(|p| !is_terminating(p));
            return self
                .publish(km, &prior, observed, Some(failure), None, None)
                .await;
        }

        let rendered = match render(&km.spec.template, &km.spec.connection_config) {
            Ok(rendered) => rendered,
            Err(e) => {
                let err = e.into_error(self.key);
                if err.class() != ErrorClass::Validation {
                    return Err(err);
                }
                warn!(kernel_manager = %self.key, error = %err, "template rejected");
                let failure = Failure {
                    reason: reasons::VALIDATION_ERROR,
                    message: err.message(),
                };
                let observed = primary_pod(&pods, &desired_name).filter(|p| !is_terminating(p));
                return self
                    .publish(km, &prior, observed, Some(failure), None, None)
                    .await;
            }
        };

        if let Some(latched) = latched_failure(km, &prior) {
            debug!(
                kernel_manager = %self.key,
                reason = latched.reason,
                "failure latched for this generation, skipping actions"
            );
            let observed = primary_pod(&pods, &desired_name).filter(|p| !is_terminating(p));
            return self
                .publish(km, &prior, observed, Some(latched), None, None)
                .await;
        }

        let plan = plan(&rendered, self.name, &desired_name, &pods);
        debug!(kernel_manager = %self.key, ?plan, "planned");

        let action = match plan {
            Plan::Converged => {
                let observed = primary_pod(&pods, &desired_name);
                return self.publish(km, &prior, observed, None, None, None).await;
            }
            Plan::Wait => {
                return self
                    .publish(
                        km,
                        &prior,
                        None,
                        None,
                        None,
                        Some(self.ctx.config.requeue.terminating),
                    )
                    .await;
            }
            Plan::Act(action) => action,
        };

        // The resource may have been deleted while we were looking at it
        match self
            .store()
            .get_kernel_manager(self.namespace, self.name)
            .await?
        {
            None => {
                debug!(kernel_manager = %self.key, %action, "resource gone, dropping action");
                return Ok(ReconcileOutcome::done());
            }
            Some(fresh) if fresh.meta().deletion_timestamp.is_some() => {
                debug!(kernel_manager = %self.key, %action, "deletion requested, dropping action");
                return self.finalize(fresh).await;
            }
            Some(_) => {}
        }

        self.execute(km, &prior, &pods, rendered, &desired_name, action)
            .await
    }

    async fn execute(
        &self,
        km: &KernelManager,
        prior: &KernelManagerStatus,
        pods: &[Pod],
        rendered: RenderedWorkload,
        desired_name: &str,
        action: CorrectiveAction,
    ) -> Result<ReconcileOutcome, Error> {
        info!(
            kernel_manager = %self.key,
            pod = action.pod_name(),
            %action,
            "issuing corrective action"
        );

        match &action {
            CorrectiveAction::Create { name } => {
                let owner = km.controller_owner_ref(&()).ok_or_else(|| {
                    Error::internal_with_context("reconciler", "cannot build owner reference")
                })?;
                let pod = rendered.into_pod(name, self.namespace, self.name, owner);

                match self.store().create_pod(self.namespace, &pod).await {
                    Ok(created) => {
                        self.publish(km, prior, Some(&created), None, Some(action), None)
                            .await
                    }
                    Err(e) if e.class() == ErrorClass::UnrecoverableCreate => {
                        warn!(kernel_manager = %self.key, error = %e, "pod rejected by the platform");
                        let failure = Failure {
                            reason: reasons::UNRECOVERABLE_CREATE_ERROR,
                            message: e.message(),
                        };
                        self.publish(km, prior, None, Some(failure), Some(action), None)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            CorrectiveAction::UpdateMetadata {
                name,
                labels,
                annotations,
            } => {
                match self
                    .store()
                    .patch_pod_metadata(self.namespace, name, labels, annotations)
                    .await
                {
                    Ok(()) => {
                        let observed = primary_pod(pods, desired_name);
                        self.publish(km, prior, observed, None, Some(action), None)
                            .await
                    }
                    Err(e) if e.class() == ErrorClass::Gone => {
                        debug!(kernel_manager = %self.key, pod = %name, "pod vanished before patch");
                        self.publish(km, prior, None, None, Some(action), Some(Duration::ZERO))
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            CorrectiveAction::Delete { name, reason } => {
                let requeue = match self.store().delete_pod(self.namespace, name).await {
                    Ok(()) => self.ctx.config.requeue.terminating,
                    Err(e) if e.class() == ErrorClass::Gone => Duration::ZERO,
                    Err(e) => return Err(e),
                };
                let observed = match reason {
                    DeleteReason::Duplicate => primary_pod(pods, desired_name),
                    _ => None,
                };
                self.publish(km, prior, observed, None, Some(action), Some(requeue))
                    .await
            }
        }
    }

    /// Teardown path: remove owned pods one at a time, then the finalizer
    async fn finalize(&self, km: KernelManager) -> Result<ReconcileOutcome, Error> {
        if !has_finalizer(&km) {
            debug!(kernel_manager = %self.key, "deleting without our finalizer");
            return Ok(ReconcileOutcome::done());
        }

        let uid = km.uid().unwrap_or_default();
        let pods = self
            .store()
            .list_owned_pods(self.namespace, self.name, &uid)
            .await?;

        if pods.is_empty() {
            self.store()
                .remove_finalizer(self.namespace, self.name, FINALIZER)
                .await?;
            self.ctx.backoff.reset(self.key);
            info!(kernel_manager = %self.key, "kernel pod gone, finalizer removed");
            return Ok(ReconcileOutcome::done());
        }

        let action = match pods.iter().find(|p| !is_terminating(p)) {
            Some(pod) => {
                let name = pod.name_any();
                match self.store().delete_pod(self.namespace, &name).await {
                    Ok(()) | Err(Error::Gone { .. }) => {}
                    Err(e) => return Err(e),
                }
                info!(kernel_manager = %self.key, pod = %name, "deleting kernel pod");
                Some(CorrectiveAction::Delete {
                    name,
                    reason: DeleteReason::Teardown,
                })
            }
            None => None,
        };

        let prior = km.status.clone().unwrap_or_default();
        let mut conds = prior.conditions.clone();
        conds = conditions::upsert_at(
            conds,
            Condition::observed_at(
                types::TERMINATING,
                ConditionStatus::True,
                reasons::DELETION_REQUESTED,
                "KernelManager is being deleted",
                self.now,
            ),
            self.now,
        );
        if conditions::find(&conds, types::READY).is_some() {
            conds = conditions::upsert_at(
                conds,
                Condition::observed_at(
                    types::READY,
                    ConditionStatus::False,
                    reasons::DELETION_REQUESTED,
                    "kernel pod is being torn down",
                    self.now,
                ),
                self.now,
            );
        }

        let observed = ObservedWorkload {
            deletion_requested: true,
            pod: pods.first(),
        };
        let (phase, container_state) = aggregate(&conds, &observed);
        let status = KernelManagerStatus::with_phase(phase)
            .conditions(conds)
            .container_state(container_state)
            .observed_generation(km.meta().generation)
            .workload_name(pods.first().map(|p| p.name_any()));

        let status_written = self.write_status(&km, &prior, status).await?;
        self.ctx.backoff.reset(self.key);

        Ok(ReconcileOutcome {
            requeue_after: Some(self.ctx.config.requeue.terminating),
            action,
            phase: Some(phase),
            status_written,
        })
    }

    /// Rebuild status from the observed pod and write it if anything changed
    async fn publish(
        &self,
        km: &KernelManager,
        prior: &KernelManagerStatus,
        pod: Option<&Pod>,
        failure: Option<Failure>,
        action: Option<CorrectiveAction>,
        requeue_override: Option<Duration>,
    ) -> Result<ReconcileOutcome, Error> {
        let conds = self.next_conditions(prior, pod, failure);
        let observed = ObservedWorkload::with_pod(pod);
        let (phase, container_state) = aggregate(&conds, &observed);

        let status = KernelManagerStatus::with_phase(phase)
            .conditions(conds)
            .container_state(container_state)
            .observed_generation(km.meta().generation)
            .workload_name(pod.map(|p| p.name_any()));

        let status_written = self.write_status(km, prior, status).await?;
        if status_written {
            info!(kernel_manager = %self.key, %phase, "status updated");
        }

        Ok(ReconcileOutcome {
            requeue_after: Some(
                requeue_override.unwrap_or_else(|| self.ctx.config.requeue.for_phase(phase)),
            ),
            action,
            phase: Some(phase),
            status_written,
        })
    }

    /// Carry the prior history forward and record what this pass observed
    fn next_conditions(
        &self,
        prior: &KernelManagerStatus,
        pod: Option<&Pod>,
        failure: Option<Failure>,
    ) -> Vec<Condition> {
        let now = self.now;
        let mut conds = prior.conditions.clone();
        let record = |conds: Vec<Condition>,
                      type_: &str,
                      status: ConditionStatus,
                      reason: &str,
                      message: String| {
            conditions::upsert_at(
                conds,
                Condition::observed_at(type_, status, reason, message, now),
                now,
            )
        };

        match pod {
            Some(pod) => {
                conds = record(
                    conds,
                    types::WORKLOAD_CREATED,
                    ConditionStatus::True,
                    reasons::POD_CREATED,
                    format!("kernel pod {} exists", pod.name_any()),
                );
            }
            None if conditions::find(&conds, types::WORKLOAD_CREATED).is_some() => {
                conds = record(
                    conds,
                    types::WORKLOAD_CREATED,
                    ConditionStatus::False,
                    reasons::POD_MISSING,
                    "kernel pod is absent".to_string(),
                );
            }
            None => {}
        }

        if pod.is_some_and(pod_ready) {
            conds = record(
                conds,
                types::READY,
                ConditionStatus::True,
                reasons::POD_READY,
                "kernel pod is ready".to_string(),
            );
        } else if conditions::find(&conds, types::READY).is_some() {
            conds = record(
                conds,
                types::READY,
                ConditionStatus::False,
                reasons::POD_NOT_READY,
                "kernel pod is not ready".to_string(),
            );
        }

        let failure = failure.or_else(|| {
            pod.filter(|p| pod_failed(p)).map(|_| Failure {
                reason: reasons::POD_FAILED,
                message: "kernel pod failed".to_string(),
            })
        });

        match failure {
            Some(failure) => {
                conds = record(
                    conds,
                    types::FAILED,
                    ConditionStatus::True,
                    failure.reason,
                    failure.message,
                );
            }
            None if conditions::find(&conds, types::FAILED).is_some() => {
                conds = record(
                    conds,
                    types::FAILED,
                    ConditionStatus::False,
                    reasons::RECOVERED,
                    "no failure observed".to_string(),
                );
            }
            None => {}
        }

        conds
    }

    /// Replace status on a copy of `km` when it differs from `prior`
    async fn write_status(
        &self,
        km: &KernelManager,
        prior: &KernelManagerStatus,
        status: KernelManagerStatus,
    ) -> Result<bool, Error> {
        if km.status.is_some() && prior.semantically_eq(&status) {
            debug!(kernel_manager = %self.key, "status unchanged");
            return Ok(false);
        }

        let mut updated = km.clone();
        updated.status = Some(status);
        self.store().replace_status(&updated).await?;
        Ok(true)
    }
}

/// A create rejection or exhausted budget recorded for the current generation
fn latched_failure(km: &KernelManager, prior: &KernelManagerStatus) -> Option<Failure> {
    let failed = prior.condition(types::FAILED).filter(|c| c.is_true())?;
    let latching = [
        reasons::UNRECOVERABLE_CREATE_ERROR,
        reasons::RETRY_BUDGET_EXHAUSTED,
    ];
    let reason = latching.into_iter().find(|r| *r == failed.reason)?;
    if prior.observed_generation != km.meta().generation {
        return None;
    }
    Some(Failure {
        reason,
        message: failed.message.clone(),
    })
}
