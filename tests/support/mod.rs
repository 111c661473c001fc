//! In-memory resource store for reconciler stories
//!
//! Behaves like a tiny API server: every write bumps `resourceVersion`,
//! status replaces are rejected on a stale version, finalizers hold back
//! deletion, and failures can be injected per verb.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Container, ContainerState as PodContainerState, ContainerStateRunning,
    ContainerStateTerminated, ContainerStatus, Pod, PodCondition, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::core::ErrorResponse;
use kube::ResourceExt;

use kernel_manager::config::ControllerConfig;
use kernel_manager::controller::{
    is_owned_by, reconcile_key, Context, KernelStore, ReconcileOutcome, KIND_KERNEL_MANAGER,
    KIND_POD,
};
use kernel_manager::crd::{
    KernelConnectionConfig, KernelManager, KernelManagerSpec, KernelTemplateSpec, KernelTransport,
};
use kernel_manager::template::owner_label_value;
use kernel_manager::{Error, MANAGED_BY_LABEL, MANAGED_BY_VALUE, OWNER_NAME_LABEL};

pub const NAMESPACE: &str = "notebooks";

// =============================================================================
// Fixtures
// =============================================================================

/// A valid KernelManager as a user would submit it
pub fn kernel_manager(name: &str) -> KernelManager {
    KernelManager {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: KernelManagerSpec {
            template: KernelTemplateSpec {
                metadata: Default::default(),
                spec: PodSpec {
                    containers: vec![Container {
                        name: "kernel".to_string(),
                        image: Some("jupyter/base-notebook:2024-01".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            },
            connection_config: KernelConnectionConfig {
                ip: "0.0.0.0".to_string(),
                transport: KernelTransport::Tcp,
                shell_port: 52001,
                iopub_port: 52002,
                stdin_port: 52003,
                control_port: 52004,
                hb_port: 52005,
                signature_scheme: "hmac-sha256".to_string(),
                key: Some("c2VjcmV0".to_string()),
                kernel_name: Some("python3".to_string()),
            },
        },
        status: None,
    }
}

/// Configuration with short intervals and a small retry budget
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        retry_budget: 3,
        ..Default::default()
    }
}

/// Store plus the context the reconciler runs with
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let store = Arc::new(FakeStore::default());
        let ctx = Arc::new(Context::new(store.clone(), config));
        Self { store, ctx }
    }

    /// Run one pass for `name`
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome, Error> {
        reconcile_key(NAMESPACE, name, &self.ctx).await
    }

    /// Run passes until one issues no action, returning the last outcome
    pub async fn settle(&self, name: &str) -> ReconcileOutcome {
        for _ in 0..10 {
            let outcome = self.reconcile(name).await.expect("pass should succeed");
            if outcome.action.is_none() {
                return outcome;
            }
        }
        panic!("{name} did not settle within 10 passes");
    }
}

// =============================================================================
// Fake store
// =============================================================================

/// Store verb, used to target injected failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    GetKernelManager,
    ListPods,
    CreatePod,
    PatchPod,
    DeletePod,
    AddFinalizer,
    RemoveFinalizer,
    ReplaceStatus,
}

impl Verb {
    fn kind(self) -> &'static str {
        match self {
            Verb::ListPods | Verb::CreatePod | Verb::PatchPod | Verb::DeletePod => KIND_POD,
            _ => KIND_KERNEL_MANAGER,
        }
    }
}

/// Failure returned instead of performing a verb
#[derive(Clone, Debug)]
pub enum Fault {
    /// Server unavailable or timed out
    Transient,
    /// Stale resourceVersion or name already taken
    Conflict,
    /// Platform rejected the object (quota, admission, invalid)
    Rejected(String),
    /// The target was deleted by someone else just before the call
    Gone,
}

impl Fault {
    fn into_error(self, verb: Verb, target: &str) -> Error {
        let api_error = |code: u16, reason: &str| {
            kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("injected: {reason}"),
                reason: reason.to_string(),
                code,
            })
        };
        match self {
            Fault::Transient => {
                Error::from_kube(api_error(503, "ServiceUnavailable"), verb.kind(), target)
            }
            Fault::Conflict => Error::conflict(target, "injected: object has been modified"),
            Fault::Rejected(msg) => Error::unrecoverable_create(target, msg),
            Fault::Gone => Error::from_kube(api_error(404, "NotFound"), verb.kind(), target),
        }
    }
}

/// Write counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub create_calls: usize,
    pub delete_calls: usize,
    pub patch_calls: usize,
    pub status_writes: usize,
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    kernel_managers: BTreeMap<Key, KernelManager>,
    pods: BTreeMap<Key, Pod>,
    version: u64,
    uid: u64,
    counters: Counters,
    faults: HashMap<Verb, VecDeque<Fault>>,
    graceful_pod_deletion: bool,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn next_uid(&mut self, prefix: &str) -> String {
        self.uid += 1;
        format!("{prefix}-{:04}", self.uid)
    }

    fn take_fault(&mut self, verb: Verb) -> Option<Fault> {
        self.faults.get_mut(&verb).and_then(|q| q.pop_front())
    }

    /// Pop the next fault for `verb`; a Gone fault also removes its target
    fn fail(&mut self, verb: Verb, namespace: &str, target: &str) -> Option<Error> {
        let fault = self.take_fault(verb)?;
        if matches!(fault, Fault::Gone) {
            let k = key(namespace, target);
            match verb.kind() {
                KIND_POD => {
                    self.pods.remove(&k);
                }
                _ => {
                    self.kernel_managers.remove(&k);
                }
            }
        }
        Some(fault.into_error(verb, target))
    }

    fn kernel_manager_mut(&mut self, namespace: &str, name: &str) -> Result<&mut KernelManager, Error> {
        self.kernel_managers
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::gone(KIND_KERNEL_MANAGER, name))
    }
}

/// In-memory [`KernelStore`]
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
    create_delay: Mutex<Option<Duration>>,
}

impl FakeStore {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Submit a KernelManager as `kubectl apply` would
    pub fn apply(&self, mut km: KernelManager) -> KernelManager {
        let mut state = self.state();
        km.metadata.uid = Some(state.next_uid("km"));
        km.metadata.generation = Some(1);
        km.metadata.resource_version = Some(state.next_version());
        km.metadata.creation_timestamp = Some(Time(Utc::now()));
        let k = key(&km.namespace().unwrap_or_default(), &km.name_any());
        state.kernel_managers.insert(k, km.clone());
        km
    }

    /// Edit the spec, bumping generation
    pub fn update_spec(&self, name: &str, edit: impl FnOnce(&mut KernelManagerSpec)) {
        let mut state = self.state();
        let version = state.next_version();
        let km = state
            .kernel_managers
            .get_mut(&key(NAMESPACE, name))
            .expect("kernel manager exists");
        edit(&mut km.spec);
        km.metadata.generation = Some(km.metadata.generation.unwrap_or(0) + 1);
        km.metadata.resource_version = Some(version);
    }

    /// Request deletion; the object stays while finalizers remain
    pub fn request_deletion(&self, name: &str) {
        let mut state = self.state();
        let version = state.next_version();
        let k = key(NAMESPACE, name);
        let Some(km) = state.kernel_managers.get_mut(&k) else {
            return;
        };
        if km.finalizers().is_empty() {
            state.kernel_managers.remove(&k);
            return;
        }
        km.metadata.deletion_timestamp = Some(Time(Utc::now()));
        km.metadata.resource_version = Some(version);
    }

    pub fn kernel_manager(&self, name: &str) -> Option<KernelManager> {
        self.state().kernel_managers.get(&key(NAMESPACE, name)).cloned()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state().pods.get(&key(NAMESPACE, name)).cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state().pods.keys().map(|(_, n)| n.clone()).collect()
    }

    /// Insert a pod directly, as another actor would
    pub fn insert_pod(&self, mut pod: Pod) {
        let mut state = self.state();
        pod.metadata.uid = Some(state.next_uid("pod"));
        pod.metadata.resource_version = Some(state.next_version());
        let k = key(&pod.namespace().unwrap_or_default(), &pod.name_any());
        state.pods.insert(k, pod);
    }

    /// Mutate a pod in place, as the kubelet or a user would
    pub fn edit_pod(&self, name: &str, edit: impl FnOnce(&mut Pod)) {
        let mut state = self.state();
        let version = state.next_version();
        let pod = state
            .pods
            .get_mut(&key(NAMESPACE, name))
            .expect("pod exists");
        edit(pod);
        pod.metadata.resource_version = Some(version);
    }

    /// Kubelet reports the kernel container running and ready
    pub fn mark_pod_ready(&self, name: &str) {
        self.edit_pod(name, |pod| {
            let container = kernel_container_name(pod);
            pod.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                container_statuses: Some(vec![ContainerStatus {
                    name: container,
                    ready: true,
                    restart_count: 0,
                    state: Some(PodContainerState {
                        running: Some(ContainerStateRunning {
                            started_at: Some(Time(Utc::now())),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        });
    }

    /// Kubelet reports the kernel container exited with `exit_code`
    pub fn mark_pod_exited(&self, name: &str, exit_code: i32) {
        self.edit_pod(name, |pod| {
            let container = kernel_container_name(pod);
            let phase = if exit_code == 0 { "Succeeded" } else { "Failed" };
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: container,
                    ready: false,
                    state: Some(PodContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code,
                            reason: Some(if exit_code == 0 { "Completed" } else { "Error" }.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        });
    }

    /// Keep deleted pods around with a deletion timestamp until
    /// [`FakeStore::finish_pod_deletions`]
    pub fn set_graceful_pod_deletion(&self, graceful: bool) {
        self.state().graceful_pod_deletion = graceful;
    }

    /// Let every terminating pod go away
    pub fn finish_pod_deletions(&self) {
        self.state()
            .pods
            .retain(|_, p| p.metadata.deletion_timestamp.is_none());
    }

    /// Slow down pod creation
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    /// Fail the next call of `verb` with `fault`
    pub fn fail_next(&self, verb: Verb, fault: Fault) {
        self.state().faults.entry(verb).or_default().push_back(fault);
    }

    pub fn counters(&self) -> Counters {
        self.state().counters
    }
}

fn kernel_container_name(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.clone())
        .unwrap_or_default()
}

/// What the API server would say about an oversized name or label value
fn invalid_metadata(pod: &Pod) -> Option<String> {
    let name = pod.name_any();
    if name.len() > 253 {
        return Some(format!("metadata.name: must be no more than 253 characters: {name}"));
    }
    pod.labels()
        .iter()
        .find(|(_, value)| value.len() > 63)
        .map(|(k, value)| format!("metadata.labels[{k}]: must be no more than 63 characters: {value}"))
}

#[async_trait]
impl KernelStore for FakeStore {
    async fn get_kernel_manager(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KernelManager>, Error> {
        let mut state = self.state();
        if let Some(err) = state.fail(Verb::GetKernelManager, namespace, name) {
            return Err(err);
        }
        Ok(state.kernel_managers.get(&key(namespace, name)).cloned())
    }

    async fn list_owned_pods(
        &self,
        namespace: &str,
        owner_name: &str,
        owner_uid: &str,
    ) -> Result<Vec<Pod>, Error> {
        let mut state = self.state();
        if let Some(fault) = state.take_fault(Verb::ListPods) {
            return Err(fault.into_error(Verb::ListPods, owner_name));
        }
        let owner_label = owner_label_value(owner_name);
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod)
            .filter(|pod| pod.labels().get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE))
            .filter(|pod| pod.labels().get(OWNER_NAME_LABEL) == Some(&owner_label))
            .filter(|pod| is_owned_by(pod, owner_uid))
            .cloned()
            .collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.counters.create_calls += 1;
        let name = pod.name_any();
        if let Some(fault) = state.take_fault(Verb::CreatePod) {
            return Err(fault.into_error(Verb::CreatePod, &name));
        }
        if let Some(reason) = invalid_metadata(pod) {
            return Err(Error::unrecoverable_create(&name, reason));
        }
        let k = key(namespace, &name);
        if state.pods.contains_key(&k) {
            return Err(Error::conflict(format!("Pod/{name}"), "already exists"));
        }

        let mut created = pod.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = Some(state.next_uid("pod"));
        created.metadata.resource_version = Some(state.next_version());
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        created.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        state.pods.insert(k, created.clone());
        Ok(created)
    }

    async fn patch_pod_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state.counters.patch_calls += 1;
        if let Some(err) = state.fail(Verb::PatchPod, namespace, name) {
            return Err(err);
        }
        let version = state.next_version();
        let pod = state
            .pods
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::gone(KIND_POD, name))?;
        pod.labels_mut().extend(labels.clone());
        pod.annotations_mut().extend(annotations.clone());
        pod.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state();
        state.counters.delete_calls += 1;
        if let Some(err) = state.fail(Verb::DeletePod, namespace, name) {
            return Err(err);
        }
        let k = key(namespace, name);
        if !state.pods.contains_key(&k) {
            return Err(Error::gone(KIND_POD, name));
        }
        if state.graceful_pod_deletion {
            let version = state.next_version();
            if let Some(pod) = state.pods.get_mut(&k) {
                if pod.metadata.deletion_timestamp.is_none() {
                    pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
                }
                pod.metadata.resource_version = Some(version);
            }
        } else {
            state.pods.remove(&k);
        }
        Ok(())
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<KernelManager, Error> {
        let mut state = self.state();
        if let Some(err) = state.fail(Verb::AddFinalizer, namespace, name) {
            return Err(err);
        }
        let version = state.next_version();
        let km = state.kernel_manager_mut(namespace, name)?;
        if !km.finalizers().iter().any(|f| f == finalizer) {
            km.finalizers_mut().push(finalizer.to_string());
            km.metadata.resource_version = Some(version);
        }
        Ok(km.clone())
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut state = self.state();
        if let Some(err) = state.fail(Verb::RemoveFinalizer, namespace, name) {
            return Err(err);
        }
        let version = state.next_version();
        let k = key(namespace, name);
        let Some(km) = state.kernel_managers.get_mut(&k) else {
            return Ok(());
        };
        km.finalizers_mut().retain(|f| f != finalizer);
        km.metadata.resource_version = Some(version);
        if km.finalizers().is_empty() && km.metadata.deletion_timestamp.is_some() {
            state.kernel_managers.remove(&k);
        }
        Ok(())
    }

    async fn replace_status(&self, km: &KernelManager) -> Result<KernelManager, Error> {
        let mut state = self.state();
        let name = km.name_any();
        let namespace = km.namespace().unwrap_or_default();
        if let Some(err) = state.fail(Verb::ReplaceStatus, &namespace, &name) {
            return Err(err);
        }
        let version = state.next_version();
        let stored = state.kernel_manager_mut(&namespace, &name)?;
        if stored.metadata.resource_version != km.metadata.resource_version {
            return Err(Error::conflict(
                format!("KernelManager/{name}"),
                "the object has been modified",
            ));
        }
        stored.status = km.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.counters.status_writes += 1;
        Ok(updated)
    }
}
