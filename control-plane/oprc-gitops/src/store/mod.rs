//! Object store abstraction the engine reconciles against.
//!
//! The engine only ever talks to an [`ObjectStore`]. Production wiring uses
//! [`KubeStore`]; tests use [`MemoryStore`] which models resourceVersion
//! conflicts and finalizer-gated deletion.

mod kube_store;
mod memory;

pub use self::kube_store::KubeStore;
pub use self::memory::{MemoryStore, StoreOp};

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, Role, RoleBinding,
};
use kube::core::{DynamicObject, TypeMeta};
use kube::discovery::ApiResource;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::crd::route::Route;
use crate::crd::{ClusterGitOpsPlatform, GitOpsPlatform};
use crate::labels::Selector;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },
    #[error("conflict writing {kind} '{name}': {message}")]
    Conflict {
        kind: ResourceKind,
        name: String,
        message: String,
    },
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ResourceKind, name: String },
    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::AlreadyExists { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Every kind the engine reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Namespace,
    ServiceAccount,
    Secret,
    Service,
    Deployment,
    StatefulSet,
    Ingress,
    Route,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    Platform,
    ClusterPlatform,
}

impl ResourceKind {
    pub fn api_resource(self) -> ApiResource {
        match self {
            ResourceKind::Namespace => ApiResource::erase::<Namespace>(&()),
            ResourceKind::ServiceAccount => {
                ApiResource::erase::<ServiceAccount>(&())
            }
            ResourceKind::Secret => ApiResource::erase::<Secret>(&()),
            ResourceKind::Service => ApiResource::erase::<Service>(&()),
            ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ResourceKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
            ResourceKind::Ingress => ApiResource::erase::<Ingress>(&()),
            ResourceKind::Route => ApiResource::erase::<Route>(&()),
            ResourceKind::Role => ApiResource::erase::<Role>(&()),
            ResourceKind::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
            ResourceKind::ClusterRole => ApiResource::erase::<ClusterRole>(&()),
            ResourceKind::ClusterRoleBinding => {
                ApiResource::erase::<ClusterRoleBinding>(&())
            }
            ResourceKind::Platform => ApiResource::erase::<GitOpsPlatform>(&()),
            ResourceKind::ClusterPlatform => {
                ApiResource::erase::<ClusterGitOpsPlatform>(&())
            }
        }
    }

    pub fn is_cluster_scoped(self) -> bool {
        matches!(
            self,
            ResourceKind::Namespace
                | ResourceKind::ClusterRole
                | ResourceKind::ClusterRoleBinding
                | ResourceKind::ClusterPlatform
        )
    }

    /// Kinds whose `status` is a subresource; plain updates never touch it.
    pub fn has_status_subresource(self) -> bool {
        matches!(
            self,
            ResourceKind::Platform | ResourceKind::ClusterPlatform
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Secret => "Secret",
            ResourceKind::Service => "Service",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Route => "Route",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::Platform => "GitOpsPlatform",
            ResourceKind::ClusterPlatform => "ClusterGitOpsPlatform",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable, optimistic-concurrency aware object store.
///
/// `update` carries the object's `resourceVersion` and fails with
/// [`StoreError::Conflict`] when it is stale. `update_status` is
/// last-write-wins.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject>;

    async fn create(
        &self,
        kind: ResourceKind,
        obj: &DynamicObject,
    ) -> StoreResult<DynamicObject>;

    async fn update(
        &self,
        kind: ResourceKind,
        obj: &DynamicObject,
    ) -> StoreResult<DynamicObject>;

    async fn update_status(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> StoreResult<()>;

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<()>;

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StoreResult<Vec<DynamicObject>>;
}

/// `get` with NotFound mapped to `None`.
pub async fn get_opt(
    store: &dyn ObjectStore,
    kind: ResourceKind,
    namespace: Option<&str>,
    name: &str,
) -> StoreResult<Option<DynamicObject>> {
    match store.get(kind, namespace, name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// `delete` that treats an already-absent object as success.
/// Returns whether something was deleted.
pub async fn delete_if_present(
    store: &dyn ObjectStore,
    kind: ResourceKind,
    namespace: Option<&str>,
    name: &str,
) -> StoreResult<bool> {
    match store.delete(kind, namespace, name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Convert a typed object into the dynamic form the store speaks.
pub fn to_dynamic<K: Serialize>(
    kind: ResourceKind,
    obj: &K,
) -> StoreResult<DynamicObject> {
    let value = serde_json::to_value(obj)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let mut dynamic: DynamicObject = serde_json::from_value(value)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    if dynamic.types.is_none() {
        dynamic.types = Some(type_meta(kind));
    }
    Ok(dynamic)
}

/// Convert a dynamic object back into its typed form.
pub fn from_dynamic<K: DeserializeOwned>(
    kind: ResourceKind,
    obj: &DynamicObject,
) -> StoreResult<K> {
    let mut obj = obj.clone();
    if obj.types.is_none() {
        obj.types = Some(type_meta(kind));
    }
    let value = serde_json::to_value(&obj)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn type_meta(kind: ResourceKind) -> TypeMeta {
    let ar = kind.api_resource();
    TypeMeta {
        api_version: ar.api_version,
        kind: ar.kind,
    }
}
