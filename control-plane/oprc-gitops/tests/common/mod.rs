#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use oprc_gitops::apis::{ApiDetector, StaticDiscovery};
use oprc_gitops::controller::events::RecordingEventSink;
use oprc_gitops::controller::registry::InstanceRegistry;
use oprc_gitops::controller::{Engine, EngineSettings};
use oprc_gitops::crd::platform::ClusterGitOpsPlatformSpec;
use oprc_gitops::crd::{
    ClaimKind, ClusterGitOpsPlatform, GitOpsPlatform, GitOpsPlatformSpec,
    InstanceKey, ManagedInstance, PlatformCommonSpec, PlatformStatus,
    instance_from_dynamic,
};
use oprc_gitops::desired::{BuilderDefaults, PlatformBuilder};
use oprc_gitops::store::{
    MemoryStore, ObjectStore, ResourceKind, StoreOp, from_dynamic, to_dynamic,
};

// DNS-1123 safe suffix for unique names
pub const ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e',
    'f',
];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &ALPHABET))
}

pub fn defaults() -> BuilderDefaults {
    BuilderDefaults {
        image: "quay.io/argoproj/argocd:v2.14.2".into(),
        cache_image: "redis:7.2.7-alpine".into(),
        dex_image: "ghcr.io/dexidp/dex:v2.41.1".into(),
        ..Default::default()
    }
}

pub fn platform(ns: &str, name: &str) -> GitOpsPlatform {
    let mut p = GitOpsPlatform::new(name, GitOpsPlatformSpec::default());
    p.metadata.namespace = Some(ns.to_string());
    p
}

pub fn cluster_platform(name: &str, control_plane_ns: &str) -> ClusterGitOpsPlatform {
    ClusterGitOpsPlatform::new(
        name,
        ClusterGitOpsPlatformSpec {
            control_plane_namespace: Some(control_plane_ns.to_string()),
            ..Default::default()
        },
    )
}

/// Engine wired to an in-memory store and a recording event sink.
pub struct Harness {
    pub store: MemoryStore,
    pub engine: Engine,
    pub events: Arc<RecordingEventSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    /// A cluster that serves the OpenShift Route API.
    pub fn openshift() -> Self {
        let mut h = Self::new();
        h.engine = h
            .engine
            .with_api_detector(Arc::new(ApiDetector::new(StaticDiscovery::openshift())));
        h
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        let store = MemoryStore::new();
        let events = Arc::new(RecordingEventSink::default());
        let engine = Engine::new(
            Arc::new(store.clone()),
            Arc::new(PlatformBuilder::new(defaults())),
            events.clone(),
            Arc::new(InstanceRegistry::new()),
            settings,
        );
        Self {
            store,
            engine,
            events,
        }
    }

    pub async fn namespaces(&self, names: &[&str]) {
        for name in names {
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            let obj = to_dynamic(ResourceKind::Namespace, &ns).unwrap();
            self.store.seed(ResourceKind::Namespace, obj).await;
        }
    }

    pub async fn create(&self, p: &GitOpsPlatform) -> InstanceKey {
        let obj = to_dynamic(ResourceKind::Platform, p).unwrap();
        self.store.create(ResourceKind::Platform, &obj).await.unwrap();
        p.key()
    }

    pub async fn create_cluster(&self, p: &ClusterGitOpsPlatform) -> InstanceKey {
        let obj = to_dynamic(ResourceKind::ClusterPlatform, p).unwrap();
        self.store
            .create(ResourceKind::ClusterPlatform, &obj)
            .await
            .unwrap();
        p.key()
    }

    pub async fn instance(&self, key: &InstanceKey) -> Option<Box<dyn ManagedInstance>> {
        let obj = self
            .store
            .object(key.kind, key.namespace.as_deref(), &key.name)
            .await?;
        Some(instance_from_dynamic(key.kind, &obj).unwrap())
    }

    pub async fn status(&self, key: &InstanceKey) -> Option<PlatformStatus> {
        self.instance(key).await?.status().cloned()
    }

    /// Mutate the instance spec through a regular update.
    pub async fn edit(&self, key: &InstanceKey, f: impl FnOnce(&mut PlatformCommonSpec)) {
        let obj = self
            .store
            .object(key.kind, key.namespace.as_deref(), &key.name)
            .await
            .expect("instance exists");
        let updated = match key.kind {
            ResourceKind::ClusterPlatform => {
                let mut p: ClusterGitOpsPlatform = from_dynamic(key.kind, &obj).unwrap();
                f(&mut p.spec.common);
                to_dynamic(key.kind, &p).unwrap()
            }
            _ => {
                let mut p: GitOpsPlatform = from_dynamic(key.kind, &obj).unwrap();
                f(&mut p.spec.common);
                to_dynamic(key.kind, &p).unwrap()
            }
        };
        self.store.update(key.kind, &updated).await.unwrap();
    }

    pub async fn delete(&self, key: &InstanceKey) {
        self.store
            .delete(key.kind, key.namespace.as_deref(), &key.name)
            .await
            .unwrap();
    }

    pub async fn child(
        &self,
        kind: ResourceKind,
        ns: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        self.store.object(kind, ns, name).await
    }

    pub async fn ns_labels(&self, ns: &str) -> BTreeMap<String, String> {
        self.store
            .object(ResourceKind::Namespace, None, ns)
            .await
            .and_then(|o| o.metadata.labels)
            .unwrap_or_default()
    }

    pub async fn claim_label(&self, ns: &str, kind: ClaimKind) -> Option<String> {
        self.ns_labels(ns).await.get(kind.label_key()).cloned()
    }

    /// Writes recorded since the last reset, excluding status.
    pub async fn object_writes(&self) -> Vec<(StoreOp, ResourceKind, String)> {
        self.store
            .write_log()
            .await
            .into_iter()
            .filter(|(op, _, _)| *op != StoreOp::UpdateStatus)
            .collect()
    }
}
