//! One abstraction over both platform variants.
//!
//! Every engine component operates on `&dyn ManagedInstance`; the concrete
//! CRD types only appear here and at the controller boundary.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::DynamicObject;

use super::platform::{
    AgentSpec, ClusterGitOpsPlatform, DEFAULT_CONTROL_PLANE_NAMESPACE,
    GitOpsPlatform, PlatformCommonSpec, PlatformStatus,
};
use crate::labels::FINALIZER;
use crate::store::{ResourceKind, StoreResult, from_dynamic};

/// Stable identity of an instance, encoded as a label value.
///
/// Cluster-scoped instances render as `<name>`, namespaced ones as
/// `<namespace>.<name>`. Namespace names cannot contain dots so the
/// encoding round-trips.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    namespace: Option<String>,
    name: String,
}

impl InstanceId {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn from_label(value: &str) -> Self {
        match value.split_once('.') {
            Some((ns, name)) => Self::namespaced(ns, name),
            None => Self::cluster(value),
        }
    }

    pub fn label_value(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}.{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label_value())
    }
}

/// Work-queue key handed to the engine by the controller runtime.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl InstanceKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Platform,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::ClusterPlatform,
            namespace: None,
            name: name.into(),
        }
    }

    pub fn id(&self) -> InstanceId {
        match &self.namespace {
            Some(ns) => InstanceId::namespaced(ns, &self.name),
            None => InstanceId::cluster(&self.name),
        }
    }
}

/// Kinds of cross-namespace trust an instance can claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClaimKind {
    Apps,
    AppSets,
    Notifications,
}

impl ClaimKind {
    /// Claim order; apps must precede the kinds that depend on it.
    pub const ALL: [ClaimKind; 3] =
        [ClaimKind::Apps, ClaimKind::AppSets, ClaimKind::Notifications];

    pub fn label_key(self) -> &'static str {
        match self {
            ClaimKind::Apps => "gitops.oaas.io/apps-managed-by",
            ClaimKind::AppSets => "gitops.oaas.io/appsets-managed-by",
            ClaimKind::Notifications => "gitops.oaas.io/notifications-managed-by",
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            ClaimKind::Apps => "apps",
            ClaimKind::AppSets => "appsets",
            ClaimKind::Notifications => "notifications",
        }
    }
}

impl fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

pub trait ManagedInstance: Send + Sync {
    fn meta(&self) -> &ObjectMeta;
    fn common(&self) -> &PlatformCommonSpec;
    fn status(&self) -> Option<&PlatformStatus>;
    fn is_cluster_scoped(&self) -> bool;
    /// Namespace receiving the instance's namespaced children.
    fn target_namespace(&self) -> String;
    fn agent(&self) -> Option<&AgentSpec>;

    fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    fn resource_kind(&self) -> ResourceKind {
        if self.is_cluster_scoped() {
            ResourceKind::ClusterPlatform
        } else {
            ResourceKind::Platform
        }
    }

    fn key(&self) -> InstanceKey {
        InstanceKey {
            kind: self.resource_kind(),
            namespace: if self.is_cluster_scoped() {
                None
            } else {
                self.meta().namespace.clone()
            },
            name: self.name(),
        }
    }

    fn id(&self) -> InstanceId {
        self.key().id()
    }

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().labels.as_ref()
    }

    fn has_finalizer(&self) -> bool {
        self.meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Source-namespace patterns for `kind`, empty when the owning
    /// component is disabled.
    fn source_namespaces(&self, kind: ClaimKind) -> Vec<String> {
        let common = self.common();
        match kind {
            ClaimKind::Apps => common.source_namespaces.clone(),
            ClaimKind::AppSets if common.appset_enabled() => common
                .application_set
                .as_ref()
                .map(|a| a.source_namespaces.clone())
                .unwrap_or_default(),
            ClaimKind::Notifications if common.notifications_enabled() => common
                .notifications
                .as_ref()
                .map(|n| n.source_namespaces.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Controller owner reference pointing at this instance.
    fn owner_reference(&self) -> Option<OwnerReference> {
        let ar = self.resource_kind().api_resource();
        Some(OwnerReference {
            api_version: ar.api_version,
            kind: ar.kind,
            name: self.name(),
            uid: self.meta().uid.clone()?,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

impl ManagedInstance for GitOpsPlatform {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn common(&self) -> &PlatformCommonSpec {
        &self.spec.common
    }

    fn status(&self) -> Option<&PlatformStatus> {
        self.status.as_ref()
    }

    fn is_cluster_scoped(&self) -> bool {
        false
    }

    fn target_namespace(&self) -> String {
        self.metadata.namespace.clone().unwrap_or_else(|| "default".into())
    }

    fn agent(&self) -> Option<&AgentSpec> {
        None
    }
}

impl ManagedInstance for ClusterGitOpsPlatform {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn common(&self) -> &PlatformCommonSpec {
        &self.spec.common
    }

    fn status(&self) -> Option<&PlatformStatus> {
        self.status.as_ref()
    }

    fn is_cluster_scoped(&self) -> bool {
        true
    }

    fn target_namespace(&self) -> String {
        self.spec
            .control_plane_namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTROL_PLANE_NAMESPACE.to_string())
    }

    fn agent(&self) -> Option<&AgentSpec> {
        self.spec.agent.as_ref().filter(|a| a.enabled)
    }
}

/// Decode a stored instance of either variant.
pub fn instance_from_dynamic(
    kind: ResourceKind,
    obj: &DynamicObject,
) -> StoreResult<Box<dyn ManagedInstance>> {
    Ok(match kind {
        ResourceKind::ClusterPlatform => {
            Box::new(from_dynamic::<ClusterGitOpsPlatform>(kind, obj)?)
        }
        _ => Box::new(from_dynamic::<GitOpsPlatform>(kind, obj)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::platform::{
        ApplicationSetSpec, ClusterGitOpsPlatformSpec, GitOpsPlatformSpec,
        NotificationsSpec,
    };

    #[test]
    fn instance_id_label_round_trip() {
        let ns = InstanceId::namespaced("team-a", "argo");
        assert_eq!(ns.label_value(), "team-a.argo");
        assert_eq!(InstanceId::from_label("team-a.argo"), ns);
        let cl = InstanceId::cluster("shared");
        assert_eq!(InstanceId::from_label(&cl.label_value()), cl);
    }

    #[test]
    fn source_namespaces_follow_feature_toggles() {
        let mut p = GitOpsPlatform::new("argo", GitOpsPlatformSpec::default());
        p.metadata.namespace = Some("team-a".into());
        p.spec.common.source_namespaces = vec!["dev-*".into()];
        p.spec.common.application_set = Some(ApplicationSetSpec {
            enabled: Some(false),
            source_namespaces: vec!["dev-1".into()],
            ..Default::default()
        });
        p.spec.common.notifications = Some(NotificationsSpec {
            enabled: true,
            source_namespaces: vec!["dev-2".into()],
            ..Default::default()
        });
        assert_eq!(p.source_namespaces(ClaimKind::Apps), vec!["dev-*"]);
        assert!(p.source_namespaces(ClaimKind::AppSets).is_empty());
        assert_eq!(p.source_namespaces(ClaimKind::Notifications), vec!["dev-2"]);
        assert_eq!(p.id().label_value(), "team-a.argo");
        assert_eq!(p.target_namespace(), "team-a");
    }

    #[test]
    fn cluster_variant_defaults_target_namespace() {
        let p = ClusterGitOpsPlatform::new("shared", ClusterGitOpsPlatformSpec::default());
        assert!(p.is_cluster_scoped());
        assert_eq!(p.target_namespace(), DEFAULT_CONTROL_PLANE_NAMESPACE);
        assert_eq!(p.key(), InstanceKey::cluster("shared"));
        assert!(p.owner_reference().is_none());
    }
}
