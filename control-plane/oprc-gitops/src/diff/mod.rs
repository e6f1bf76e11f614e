//! Kind-specific diff policies.
//!
//! A policy compares only the fields the operator manages and patches that
//! subset onto the live object, so anything else (server defaults, fields
//! set by other controllers) survives the update untouched.

pub mod args;
pub mod network;
pub mod pod;
pub mod rbac;
pub mod workload;

pub use args::append_unique_args;

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::core::DynamicObject;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::labels::preserve_reserved;
use crate::store::{ResourceKind, StoreResult, from_dynamic, to_dynamic};

/// Result of comparing a live object against its desired form.
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    /// Human-readable names of the fields that differ, in discovery order.
    pub changes: Vec<String>,
    /// The live object with the changed fields overwritten.
    pub patched: DynamicObject,
    /// An immutable field differs; the object must be deleted and recreated.
    pub recreate: bool,
}

impl DiffOutcome {
    pub fn is_changed(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Comma-joined change list, e.g. `container image, env`.
    pub fn explanation(&self) -> String {
        self.changes.join(", ")
    }
}

/// Accumulates changed field names while a policy walks an object.
#[derive(Debug, Default)]
pub struct Changes {
    list: Vec<String>,
    recreate: bool,
}

impl Changes {
    pub fn push(&mut self, what: impl Into<String>) {
        let what = what.into();
        if !self.list.contains(&what) {
            self.list.push(what);
        }
    }

    /// Overwrite `live` with `desired` when they differ.
    pub fn sync<T: PartialEq + Clone>(
        &mut self,
        what: &str,
        live: &mut T,
        desired: &T,
    ) {
        if live != desired {
            *live = desired.clone();
            self.push(what);
        }
    }

    /// Like [`Changes::sync`] but only when the desired side is set, leaving
    /// server-defaulted values alone.
    pub fn sync_set<T: PartialEq + Clone>(
        &mut self,
        what: &str,
        live: &mut Option<T>,
        desired: &Option<T>,
    ) {
        if desired.is_some() && live != desired {
            *live = desired.clone();
            self.push(what);
        }
    }

    /// Compare collections treating `None` and empty as equal.
    pub fn sync_vec<T: PartialEq + Clone>(
        &mut self,
        what: &str,
        live: &mut Option<Vec<T>>,
        desired: &Option<Vec<T>>,
    ) {
        let l = live.as_deref().unwrap_or_default();
        let d = desired.as_deref().unwrap_or_default();
        if l != d {
            *live = desired.clone();
            self.push(what);
        }
    }

    pub fn immutable<T: PartialEq>(&mut self, what: &str, live: &T, desired: &T) {
        if live != desired {
            self.recreate = true;
            self.push(what);
        }
    }
}

fn non_empty(map: Option<BTreeMap<String, String>>) -> Option<BTreeMap<String, String>> {
    map.filter(|m| !m.is_empty())
}

/// Labels, annotations and owner references. Reserved keys present on the
/// live object are merged into the desired maps first so they are kept.
pub fn diff_metadata(live: &mut ObjectMeta, desired: &ObjectMeta, changes: &mut Changes) {
    let mut labels = desired.labels.clone();
    preserve_reserved(&mut labels, live.labels.as_ref());
    if non_empty(labels.clone()) != non_empty(live.labels.clone()) {
        live.labels = labels;
        changes.push("labels");
    }

    let mut annotations = desired.annotations.clone();
    preserve_reserved(&mut annotations, live.annotations.as_ref());
    if non_empty(annotations.clone()) != non_empty(live.annotations.clone()) {
        live.annotations = annotations;
        changes.push("annotations");
    }

    changes.sync_vec(
        "owner reference",
        &mut live.owner_references,
        &desired.owner_references,
    );
}

/// Per-kind diff over the typed form of an object.
pub trait TypedDiff: Send + Sync {
    type Object: Resource + Serialize + DeserializeOwned;
    const KIND: ResourceKind;

    fn diff_typed(live: &mut Self::Object, desired: &Self::Object, changes: &mut Changes);
}

pub trait DiffPolicy: Send + Sync {
    fn diff(&self, live: &DynamicObject, desired: &DynamicObject) -> StoreResult<DiffOutcome>;
}

impl<P: TypedDiff> DiffPolicy for P {
    fn diff(&self, live: &DynamicObject, desired: &DynamicObject) -> StoreResult<DiffOutcome> {
        let mut patched: P::Object = from_dynamic(P::KIND, live)?;
        let want: P::Object = from_dynamic(P::KIND, desired)?;
        let mut changes = Changes::default();
        diff_metadata(patched.meta_mut(), want.meta(), &mut changes);
        P::diff_typed(&mut patched, &want, &mut changes);
        Ok(DiffOutcome {
            changes: changes.list,
            recreate: changes.recreate,
            patched: to_dynamic(P::KIND, &patched)?,
        })
    }
}

/// Lookup table from kind to its policy.
pub struct DiffPolicyTable {
    policies: HashMap<ResourceKind, Box<dyn DiffPolicy>>,
}

impl DiffPolicyTable {
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: ResourceKind, policy: Box<dyn DiffPolicy>) {
        self.policies.insert(kind, policy);
    }

    pub fn get(&self, kind: ResourceKind) -> Option<&dyn DiffPolicy> {
        self.policies.get(&kind).map(|p| p.as_ref())
    }

    /// Policies for every child kind the operator manages.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.register(ResourceKind::Deployment, Box::new(workload::DeploymentPolicy));
        table.register(ResourceKind::StatefulSet, Box::new(workload::StatefulSetPolicy));
        table.register(ResourceKind::Service, Box::new(network::ServicePolicy));
        table.register(ResourceKind::Ingress, Box::new(network::IngressPolicy));
        table.register(ResourceKind::Route, Box::new(network::RoutePolicy));
        table.register(ResourceKind::ServiceAccount, Box::new(rbac::ServiceAccountPolicy));
        table.register(ResourceKind::Secret, Box::new(rbac::SecretPolicy));
        table.register(ResourceKind::Role, Box::new(rbac::RolePolicy));
        table.register(ResourceKind::RoleBinding, Box::new(rbac::RoleBindingPolicy));
        table.register(ResourceKind::ClusterRole, Box::new(rbac::ClusterRolePolicy));
        table.register(
            ResourceKind::ClusterRoleBinding,
            Box::new(rbac::ClusterRoleBindingPolicy),
        );
        table
    }
}

impl Default for DiffPolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}
