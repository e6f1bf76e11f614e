use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use tokio::sync::Mutex;

use super::{ObjectStore, ResourceKind, StoreError, StoreResult};
use crate::labels::Selector;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
    List,
}

impl StoreOp {
    fn is_write(self) -> bool {
        !matches!(self, StoreOp::Get | StoreOp::List)
    }
}

type Key = (ResourceKind, Option<String>, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, DynamicObject>,
    version: u64,
    writes: Vec<(StoreOp, ResourceKind, String)>,
    faults: HashMap<(StoreOp, ResourceKind), StoreError>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn check_fault(&self, op: StoreOp, kind: ResourceKind) -> StoreResult<()> {
        match self.faults.get(&(op, kind)) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn record(&mut self, op: StoreOp, kind: ResourceKind, name: &str) {
        if op.is_write() {
            self.writes.push((op, kind, name.to_string()));
        }
    }

    /// Remove an object and everything that names it as owner.
    fn remove_cascading(&mut self, key: &Key) {
        let Some(removed) = self.objects.remove(key) else {
            return;
        };
        let Some(uid) = removed.metadata.uid else {
            return;
        };
        let dependents: Vec<Key> = self
            .objects
            .iter()
            .filter(|(_, o)| {
                o.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for dep in dependents {
            self.remove_cascading(&dep);
        }
    }
}

/// In-memory [`ObjectStore`] with write accounting and fault injection.
///
/// Models optimistic concurrency on `resourceVersion`, finalizer-gated
/// deletion and owner-reference garbage collection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn key_of(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Key {
    let ns = if kind.is_cluster_scoped() {
        None
    } else {
        namespace.map(str::to_string)
    };
    (kind, ns, name.to_string())
}

fn name_of(obj: &DynamicObject) -> StoreResult<String> {
    obj.metadata
        .name
        .clone()
        .ok_or_else(|| StoreError::Invalid("object has no name".into()))
}

fn spec_of(obj: &DynamicObject) -> Option<&serde_json::Value> {
    obj.data.get("spec")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting it as a write.
    pub async fn seed(
        &self,
        kind: ResourceKind,
        mut obj: DynamicObject,
    ) -> DynamicObject {
        let mut inner = self.inner.lock().await;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let key = key_of(kind, obj.metadata.namespace.as_deref(), &name);
        let version = inner.next_version();
        obj.metadata.resource_version = Some(version.clone());
        obj.metadata
            .uid
            .get_or_insert_with(|| format!("uid-{version}"));
        if kind.is_cluster_scoped() {
            obj.metadata.namespace = None;
        }
        inner.objects.insert(key, obj.clone());
        obj
    }

    pub async fn object(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let inner = self.inner.lock().await;
        inner.objects.get(&key_of(kind, namespace, name)).cloned()
    }

    pub async fn contains(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> bool {
        self.object(kind, namespace, name).await.is_some()
    }

    pub async fn count(&self, kind: ResourceKind) -> usize {
        let inner = self.inner.lock().await;
        inner.objects.keys().filter(|(k, _, _)| *k == kind).count()
    }

    pub async fn writes(&self) -> usize {
        self.inner.lock().await.writes.len()
    }

    pub async fn write_log(&self) -> Vec<(StoreOp, ResourceKind, String)> {
        self.inner.lock().await.writes.clone()
    }

    pub async fn reset_writes(&self) {
        self.inner.lock().await.writes.clear();
    }

    /// Make every `op` on `kind` fail with `err` until cleared.
    pub async fn fail_on(&self, op: StoreOp, kind: ResourceKind, err: StoreError) {
        self.inner.lock().await.faults.insert((op, kind), err);
    }

    pub async fn clear_faults(&self) {
        self.inner.lock().await.faults.clear();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject> {
        let inner = self.inner.lock().await;
        inner.check_fault(StoreOp::Get, kind)?;
        inner
            .objects
            .get(&key_of(kind, namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    async fn create(
        &self,
        kind: ResourceKind,
        obj: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let mut inner = self.inner.lock().await;
        inner.check_fault(StoreOp::Create, kind)?;
        let name = name_of(obj)?;
        let key = key_of(kind, obj.metadata.namespace.as_deref(), &name);
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind, name });
        }
        let mut stored = obj.clone();
        let version = inner.next_version();
        stored.metadata.resource_version = Some(version.clone());
        stored.metadata.uid = Some(format!("uid-{version}"));
        stored.metadata.deletion_timestamp = None;
        stored.metadata.generation = Some(1);
        if kind.is_cluster_scoped() {
            stored.metadata.namespace = None;
        }
        inner.objects.insert(key, stored.clone());
        inner.record(StoreOp::Create, kind, &name);
        Ok(stored)
    }

    async fn update(
        &self,
        kind: ResourceKind,
        obj: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let mut inner = self.inner.lock().await;
        inner.check_fault(StoreOp::Update, kind)?;
        let name = name_of(obj)?;
        let key = key_of(kind, obj.metadata.namespace.as_deref(), &name);
        let Some(current) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound { kind, name });
        };
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict {
                    kind,
                    name,
                    message: format!(
                        "resourceVersion {rv} is stale (current {})",
                        current.metadata.resource_version.unwrap_or_default()
                    ),
                });
            }
        }

        let mut stored = obj.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.deletion_timestamp =
            current.metadata.deletion_timestamp.clone();
        stored.metadata.generation = current.metadata.generation;
        if spec_of(&stored) != spec_of(&current) {
            stored.metadata.generation =
                Some(current.metadata.generation.unwrap_or(0) + 1);
        }
        if kind.has_status_subresource() {
            match (stored.data.as_object_mut(), current.data.get("status")) {
                (Some(data), Some(status)) => {
                    data.insert("status".into(), status.clone());
                }
                (Some(data), None) => {
                    data.remove("status");
                }
                _ => {}
            }
        }
        if kind.is_cluster_scoped() {
            stored.metadata.namespace = None;
        }
        stored.metadata.resource_version = Some(inner.next_version());
        inner.record(StoreOp::Update, kind, &name);

        let finalizers_empty = stored
            .metadata
            .finalizers
            .as_ref()
            .is_none_or(|f| f.is_empty());
        if stored.metadata.deletion_timestamp.is_some() && finalizers_empty {
            inner.remove_cascading(&key);
        } else {
            inner.objects.insert(key, stored.clone());
        }
        Ok(stored)
    }

    async fn update_status(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_fault(StoreOp::UpdateStatus, kind)?;
        let key = key_of(kind, namespace, name);
        let version = inner.next_version();
        let Some(current) = inner.objects.get_mut(&key) else {
            return Err(StoreError::NotFound {
                kind,
                name: name.to_string(),
            });
        };
        if let Some(data) = current.data.as_object_mut() {
            data.insert("status".into(), status.clone());
        } else {
            current.data = serde_json::json!({ "status": status });
        }
        current.metadata.resource_version = Some(version);
        inner.record(StoreOp::UpdateStatus, kind, name);
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_fault(StoreOp::Delete, kind)?;
        let key = key_of(kind, namespace, name);
        let version = inner.next_version();
        let Some(current) = inner.objects.get_mut(&key) else {
            return Err(StoreError::NotFound {
                kind,
                name: name.to_string(),
            });
        };
        let has_finalizers = current
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if current.metadata.deletion_timestamp.is_none() {
                current.metadata.deletion_timestamp = Some(Time(Utc::now()));
                current.metadata.resource_version = Some(version);
            }
        } else {
            inner.remove_cascading(&key);
        }
        inner.record(StoreOp::Delete, kind, name);
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StoreResult<Vec<DynamicObject>> {
        let inner = self.inner.lock().await;
        inner.check_fault(StoreOp::List, kind)?;
        let ns = if kind.is_cluster_scoped() { None } else { namespace };
        Ok(inner
            .objects
            .iter()
            .filter(|((k, obj_ns, _), _)| {
                *k == kind && (ns.is_none() || obj_ns.as_deref() == ns)
            })
            .filter(|(_, o)| selector.matches(o.metadata.labels.as_ref()))
            .map(|(_, o)| o.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::core::ObjectMeta;

    fn obj(kind: ResourceKind, ns: Option<&str>, name: &str) -> DynamicObject {
        let mut o = DynamicObject::new(name, &kind.api_resource());
        o.metadata.namespace = ns.map(str::to_string);
        o
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let created = store
            .create(ResourceKind::Secret, &obj(ResourceKind::Secret, Some("a"), "s"))
            .await
            .unwrap();
        let mut first = created.clone();
        first.metadata.labels = Some([("x".to_string(), "1".to_string())].into());
        store.update(ResourceKind::Secret, &first).await.unwrap();

        let err = store.update(ResourceKind::Secret, &created).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.writes().await, 2);
    }

    #[tokio::test]
    async fn finalizer_gates_removal() {
        let store = MemoryStore::new();
        let mut o = obj(ResourceKind::ClusterPlatform, None, "p");
        o.metadata.finalizers = Some(vec!["f".into()]);
        store.create(ResourceKind::ClusterPlatform, &o).await.unwrap();
        store
            .delete(ResourceKind::ClusterPlatform, None, "p")
            .await
            .unwrap();

        let mut live = store
            .get(ResourceKind::ClusterPlatform, None, "p")
            .await
            .unwrap();
        assert!(live.metadata.deletion_timestamp.is_some());
        live.metadata.finalizers = Some(vec![]);
        store.update(ResourceKind::ClusterPlatform, &live).await.unwrap();
        assert!(!store.contains(ResourceKind::ClusterPlatform, None, "p").await);
    }

    #[tokio::test]
    async fn owner_removal_collects_dependents() {
        let store = MemoryStore::new();
        let owner = store
            .create(ResourceKind::Platform, &obj(ResourceKind::Platform, Some("a"), "p"))
            .await
            .unwrap();
        let mut child = obj(ResourceKind::Deployment, Some("a"), "p-server");
        child.metadata = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                uid: owner.metadata.uid.clone().unwrap(),
                name: "p".into(),
                kind: "GitOpsPlatform".into(),
                api_version: "gitops.oaas.io/v1beta1".into(),
                ..Default::default()
            }]),
            ..child.metadata
        };
        store.create(ResourceKind::Deployment, &child).await.unwrap();
        store.delete(ResourceKind::Platform, Some("a"), "p").await.unwrap();
        assert!(!store.contains(ResourceKind::Deployment, Some("a"), "p-server").await);
    }

    #[tokio::test]
    async fn injected_faults_fire_until_cleared() {
        let store = MemoryStore::new();
        store
            .fail_on(
                StoreOp::List,
                ResourceKind::Namespace,
                StoreError::Backend("down".into()),
            )
            .await;
        assert!(store
            .list(ResourceKind::Namespace, None, &Selector::everything())
            .await
            .is_err());
        store.clear_faults().await;
        assert!(store
            .list(ResourceKind::Namespace, None, &Selector::everything())
            .await
            .unwrap()
            .is_empty());
    }
}
