use crate::errors::{PodwireError, Result};
use crate::k8s::workload::Workload;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod, Secret};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

const FIELD_MANAGER: &str = "podwire";

/// Thin, typed wrapper around a `kube::Client`. Every cluster call podwire
/// makes — reads, patches, applies, port-forwards — goes through here, so
/// the rest of the crate never touches `kube::Api` directly.
///
/// Grounded on `pkg/k8s/client.go`'s `KubernetesClient`.
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| PodwireError::kube("connect", "Client", e))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn api<W: Workload>(&self, namespace: &str) -> Api<W> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| PodwireError::kube("list", "Namespace", e))?;
        Ok(list.items)
    }

    pub async fn get_workload<W: Workload>(&self, namespace: &str, name: &str) -> Result<W> {
        self.api::<W>(namespace)
            .get(name)
            .await
            .map_err(|e| PodwireError::kube("get", W::KIND.as_str(), e))
    }

    pub async fn list_workloads<W: Workload>(&self, namespace: &str) -> Result<Vec<W>> {
        let list = self
            .api::<W>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| PodwireError::kube("list", W::KIND.as_str(), e))?;
        Ok(list.items)
    }

    /// Applies a strategic-merge or JSON patch document built by
    /// `k8s::patch`, returning the updated object as seen by the server.
    pub async fn patch_workload<W: Workload>(
        &self,
        namespace: &str,
        name: &str,
        patch: Patch<serde_json::Value>,
    ) -> Result<W> {
        debug!(namespace, name, kind = W::KIND.as_str(), "patching workload");
        self.api::<W>(namespace)
            .patch(name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| PodwireError::kube("patch", W::KIND.as_str(), e))
    }

    /// Replaces the object wholesale — used to restore a workload from a
    /// stored rollback snapshot.
    pub async fn update_workload<W: Workload>(&self, namespace: &str, workload: &W) -> Result<W> {
        self.api::<W>(namespace)
            .replace(&workload.name(), &PostParams::default(), workload)
            .await
            .map_err(|e| PodwireError::kube("update", W::KIND.as_str(), e))
    }

    pub async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = self.api(namespace);
        let params = ListParams::default().labels(label_selector);
        let list = api
            .list(&params)
            .await
            .map_err(|e| PodwireError::kube("list", "Pod", e))?;
        Ok(list.items)
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let api: Api<Pod> = self.api(namespace);
        api.get(name)
            .await
            .map_err(|e| PodwireError::kube("get", "Pod", e))
    }

    pub async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let api: Api<Secret> = self.api(namespace);
        let name = secret
            .metadata
            .name
            .clone()
            .ok_or(PodwireError::NoResourceSelected)?;
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await
        .map_err(|e| PodwireError::kube("apply", "Secret", e))
    }

    pub async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = self.api(namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(PodwireError::kube("delete", "Secret", e)),
        }
    }

    pub async fn apply_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        let name = pvc
            .metadata
            .name
            .clone()
            .ok_or(PodwireError::NoResourceSelected)?;
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(pvc),
        )
        .await
        .map_err(|e| PodwireError::kube("apply", "PersistentVolumeClaim", e))
    }

    pub async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(PodwireError::kube("delete", "PersistentVolumeClaim", e)),
        }
    }

    /// Opens the pod `portforward` subresource as a raw duplex stream for
    /// the given container port. Callers splice this into a local TCP
    /// listener (`tunnel::portforward`) or an SSH channel.
    pub async fn port_forward_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        container_port: u16,
    ) -> Result<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin> {
        let api: Api<Pod> = self.api(namespace);
        let mut forwarder = api
            .portforward(pod_name, &[container_port])
            .await
            .map_err(|e| PodwireError::kube("portforward", "Pod", e))?;
        let stream = forwarder
            .take_stream(container_port)
            .ok_or(PodwireError::PodNotReady)?;
        Ok(stream)
    }
}
