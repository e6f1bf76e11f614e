use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use serde_json::json;
use tracing::trace;

use super::{ObjectStore, ResourceKind, StoreError, StoreResult};
use crate::labels::Selector;

/// [`ObjectStore`] backed by the Kubernetes API server.
///
/// Every call is bounded by `timeout`; a slow API server delays convergence
/// but surfaces as [`StoreError::Timeout`] instead of hanging a worker.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if !kind.is_cluster_scoped() => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn bounded<T, F>(
        &self,
        kind: ResourceKind,
        name: &str,
        fut: F,
    ) -> StoreResult<T>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(|e| map_err(kind, name, e)),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

fn map_err(kind: ResourceKind, name: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound {
                kind,
                name: name.to_string(),
            },
            409 if resp.reason == "AlreadyExists" => StoreError::AlreadyExists {
                kind,
                name: name.to_string(),
            },
            409 => StoreError::Conflict {
                kind,
                name: name.to_string(),
                message: resp.message,
            },
            422 => StoreError::Invalid(resp.message),
            _ => StoreError::Backend(format!("{}: {}", resp.code, resp.message)),
        },
        kube::Error::SerdeError(e) => StoreError::Serialization(e.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn object_name(obj: &DynamicObject) -> StoreResult<&str> {
    obj.metadata
        .name
        .as_deref()
        .ok_or_else(|| StoreError::Invalid("object has no name".into()))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject> {
        trace!(%kind, ?namespace, name, "store: get");
        let api = self.api(kind, namespace);
        self.bounded(kind, name, api.get(name)).await
    }

    async fn create(
        &self,
        kind: ResourceKind,
        obj: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let name = object_name(obj)?;
        trace!(%kind, ns = ?obj.metadata.namespace, name, "store: create");
        let api = self.api(kind, obj.metadata.namespace.as_deref());
        self.bounded(kind, name, api.create(&PostParams::default(), obj))
            .await
    }

    async fn update(
        &self,
        kind: ResourceKind,
        obj: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let name = object_name(obj)?;
        trace!(%kind, ns = ?obj.metadata.namespace, name, "store: update");
        let api = self.api(kind, obj.metadata.namespace.as_deref());
        self.bounded(kind, name, api.replace(name, &PostParams::default(), obj))
            .await
    }

    async fn update_status(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> StoreResult<()> {
        trace!(%kind, ?namespace, name, "store: update status");
        let api = self.api(kind, namespace);
        let patch = json!({ "status": status });
        self.bounded(
            kind,
            name,
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .map(|_| ())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<()> {
        trace!(%kind, ?namespace, name, "store: delete");
        let api = self.api(kind, namespace);
        self.bounded(kind, name, api.delete(name, &DeleteParams::default()))
            .await
            .map(|_| ())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StoreResult<Vec<DynamicObject>> {
        let mut lp = ListParams::default();
        if !selector.is_everything() {
            lp = lp.labels(&selector.to_string());
        }
        let api = self.api(kind, namespace);
        self.bounded(kind, "", api.list(&lp))
            .await
            .map(|list| list.items)
    }
}
