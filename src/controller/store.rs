//! Resource store abstraction
//!
//! [`KernelStore`] is the only way the reconciler touches the API server, so
//! tests can swap in a mock or an in-memory store. [`KubeStore`] is the
//! kube-rs implementation and is where API errors are classified.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::KernelManager;
use crate::template::owner_label_value;
use crate::{Error, FIELD_MANAGER, MANAGED_BY_LABEL, MANAGED_BY_VALUE, OWNER_NAME_LABEL};

/// Kind reported in errors about KernelManager objects
pub const KIND_KERNEL_MANAGER: &str = "KernelManager";
/// Kind reported in errors about kernel pods
pub const KIND_POD: &str = "Pod";

/// Store verbs the reconciler needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KernelStore: Send + Sync {
    /// Fetch a KernelManager, `None` if it does not exist
    async fn get_kernel_manager(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KernelManager>, Error>;

    /// List pods owned by the KernelManager with the given name and UID
    async fn list_owned_pods(
        &self,
        namespace: &str,
        owner_name: &str,
        owner_uid: &str,
    ) -> Result<Vec<Pod>, Error>;

    /// Create a pod
    ///
    /// Platform rejections (400, 403, 422) surface as
    /// [`Error::UnrecoverableCreate`], an existing name as [`Error::Conflict`].
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Merge labels and annotations into an existing pod
    async fn patch_pod_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Delete a pod; [`Error::Gone`] if it no longer exists
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Ensure `finalizer` is present, returning the updated resource
    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<KernelManager, Error>;

    /// Remove `finalizer` if present
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Replace the status subresource
    ///
    /// The write carries the resource's `resourceVersion`; a stale version
    /// fails with [`Error::Conflict`].
    async fn replace_status(&self, km: &KernelManager) -> Result<KernelManager, Error>;
}

/// One page of a paginated list
#[derive(Clone, Debug)]
pub struct Page<T> {
    /// Items in this page
    pub items: Vec<T>,
    /// Token for the next page, `None` on the last page
    pub continue_token: Option<String>,
}

/// Real Kubernetes store implementation
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new KubeStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn kernel_managers(&self, namespace: Option<&str>) -> Api<KernelManager> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// List one page of KernelManagers
    ///
    /// `namespace: None` lists across all namespaces.
    pub async fn list_kernel_managers(
        &self,
        namespace: Option<&str>,
        limit: u32,
        continue_token: Option<&str>,
    ) -> Result<Page<KernelManager>, Error> {
        let mut params = ListParams::default().limit(limit);
        if let Some(token) = continue_token {
            params = params.continue_token(token);
        }

        let list = self
            .kernel_managers(namespace)
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, KIND_KERNEL_MANAGER, namespace.unwrap_or("*")))?;

        Ok(Page {
            continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
            items: list.items,
        })
    }

    /// Follow continue tokens until every KernelManager has been listed
    pub async fn list_all_kernel_managers(
        &self,
        namespace: Option<&str>,
        page_size: u32,
    ) -> Result<Vec<KernelManager>, Error> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .list_kernel_managers(namespace, page_size, token.as_deref())
                .await?;
            items.extend(page.items);
            match page.continue_token {
                Some(next) => token = Some(next),
                None => return Ok(items),
            }
        }
    }
}

fn field_manager_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// True when `pod` carries an owner reference with `uid`
pub fn is_owned_by(pod: &Pod, uid: &str) -> bool {
    pod.owner_references().iter().any(|o| o.uid == uid)
}

#[async_trait]
impl KernelStore for KubeStore {
    async fn get_kernel_manager(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KernelManager>, Error> {
        self.kernel_managers(Some(namespace))
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, KIND_KERNEL_MANAGER, name))
    }

    async fn list_owned_pods(
        &self,
        namespace: &str,
        owner_name: &str,
        owner_uid: &str,
    ) -> Result<Vec<Pod>, Error> {
        let selector = format!(
            "{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{OWNER_NAME_LABEL}={}",
            owner_label_value(owner_name)
        );
        let params = ListParams::default().labels(&selector);
        let pods = self
            .pods(namespace)
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, KIND_POD, owner_name))?;

        Ok(pods
            .items
            .into_iter()
            .filter(|p| is_owned_by(p, owner_uid))
            .collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let name = pod.name_any();
        match self.pods(namespace).create(&post_params(), pod).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if matches!(ae.code, 400 | 403 | 422) => {
                Err(Error::unrecoverable_create(name, ae.message))
            }
            Err(e) => Err(Error::from_kube(e, KIND_POD, &name)),
        }
    }

    async fn patch_pod_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "labels": labels,
                "annotations": annotations,
            }
        });

        self.pods(namespace)
            .patch(name, &field_manager_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, KIND_POD, name))?;

        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(e, KIND_POD, name))?;
        debug!(pod = %name, "pod deletion requested");
        Ok(())
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<KernelManager, Error> {
        let api = self.kernel_managers(Some(namespace));

        let km = api
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, KIND_KERNEL_MANAGER, name))?;
        let mut finalizers = km.finalizers().to_vec();

        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(km);
        }

        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": km.resource_version(),
            }
        });

        api.patch(name, &field_manager_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, KIND_KERNEL_MANAGER, name))
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api = self.kernel_managers(Some(namespace));

        let Some(km) = api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, KIND_KERNEL_MANAGER, name))?
        else {
            return Ok(());
        };

        let finalizers: Vec<String> = km
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": km.resource_version(),
            }
        });

        match api
            .patch(name, &field_manager_params(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            // Removing the last finalizer can delete the object before we see the response
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube(e, KIND_KERNEL_MANAGER, name)),
        }
    }

    async fn replace_status(&self, km: &KernelManager) -> Result<KernelManager, Error> {
        let name = km.name_any();
        let namespace = km.namespace().unwrap_or_default();
        let data = serde_json::to_vec(km).map_err(|e| Error::serialization(e.to_string()))?;

        self.kernel_managers(Some(&namespace))
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| Error::from_kube(e, KIND_KERNEL_MANAGER, &name))
    }
}
