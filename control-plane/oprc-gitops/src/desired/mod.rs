//! Desired child-object graph for an instance.
//!
//! The builder is pure: everything it needs from the cluster (the cache TLS
//! checksum) is looked up by the engine and passed in through
//! [`BuildContext`].

mod cache;
mod common;
mod components;
mod dex;
mod rbac;

pub use common::{ProxyEnv, tls_checksum};

use kube::core::DynamicObject;
use serde::Serialize;

use crate::apis::Exposure;
use crate::crd::ManagedInstance;
use crate::store::{ResourceKind, StoreResult, to_dynamic};

/// What the engine should converge a single child object to.
#[derive(Clone, Debug)]
pub enum DesiredState {
    Present(Box<DynamicObject>),
    /// The owning feature is off; any live object must go.
    Absent { reason: String },
}

#[derive(Clone, Debug)]
pub struct ChildResourceDescriptor {
    pub kind: ResourceKind,
    pub name: String,
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub component: &'static str,
    /// Key into the diff policy table.
    pub policy: ResourceKind,
    pub state: DesiredState,
}

impl ChildResourceDescriptor {
    pub fn present<K: Serialize>(
        kind: ResourceKind,
        component: &'static str,
        obj: &K,
    ) -> StoreResult<Self> {
        let desired = to_dynamic(kind, obj)?;
        Ok(Self {
            kind,
            name: desired.metadata.name.clone().unwrap_or_default(),
            namespace: if kind.is_cluster_scoped() {
                None
            } else {
                desired.metadata.namespace.clone()
            },
            component,
            policy: kind,
            state: DesiredState::Present(Box::new(desired)),
        })
    }

    pub fn absent(
        kind: ResourceKind,
        namespace: Option<&str>,
        name: impl Into<String>,
        component: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: if kind.is_cluster_scoped() {
                None
            } else {
                namespace.map(str::to_string)
            },
            component,
            policy: kind,
            state: DesiredState::Absent {
                reason: reason.into(),
            },
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self.state, DesiredState::Present(_))
    }

    pub fn desired_mut(&mut self) -> Option<&mut DynamicObject> {
        match &mut self.state {
            DesiredState::Present(obj) => Some(obj.as_mut()),
            DesiredState::Absent { .. } => None,
        }
    }
}

/// Operator-wide defaults the builder falls back to.
#[derive(Clone, Debug, Default)]
pub struct BuilderDefaults {
    pub image: String,
    pub cache_image: String,
    pub dex_image: String,
    pub proxy: ProxyEnv,
}

pub struct BuildContext<'a> {
    pub instance: &'a dyn ManagedInstance,
    /// Checksum of the cache TLS secret, when TLS is on and the secret exists.
    pub tls_checksum: Option<String>,
    /// Route or Ingress, per what the cluster serves.
    pub exposure: Exposure,
}

pub trait DesiredStateBuilder: Send + Sync {
    fn build(&self, ctx: &BuildContext<'_>) -> StoreResult<Vec<ChildResourceDescriptor>>;
}

/// Hand-built typed objects for every platform component.
#[derive(Clone, Debug, Default)]
pub struct PlatformBuilder {
    defaults: BuilderDefaults,
}

impl PlatformBuilder {
    pub fn new(defaults: BuilderDefaults) -> Self {
        Self { defaults }
    }
}

impl DesiredStateBuilder for PlatformBuilder {
    fn build(&self, ctx: &BuildContext<'_>) -> StoreResult<Vec<ChildResourceDescriptor>> {
        let r = common::Renderer::new(ctx, &self.defaults);
        let mut out = Vec::new();
        components::server(&r, &mut out)?;
        components::repo_server(&r, &mut out)?;
        components::application_controller(&r, &mut out)?;
        cache::cache(&r, &mut out)?;
        components::applicationset_controller(&r, &mut out)?;
        components::notifications_controller(&r, &mut out)?;
        components::agent(&r, &mut out)?;
        dex::dex(&r, &mut out)?;
        rbac::cluster_rbac(&r, &mut out)?;
        Ok(out)
    }
}
