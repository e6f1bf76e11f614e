use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};

use super::{Changes, TypedDiff};
use crate::store::ResourceKind;

/// Metadata only; tokens and pull secrets are filled in by the cluster.
pub struct ServiceAccountPolicy;

impl TypedDiff for ServiceAccountPolicy {
    type Object = ServiceAccount;
    const KIND: ResourceKind = ResourceKind::ServiceAccount;

    fn diff_typed(_: &mut ServiceAccount, _: &ServiceAccount, _: &mut Changes) {}
}

/// Metadata and type; payloads are owned by whoever rotates them.
pub struct SecretPolicy;

impl TypedDiff for SecretPolicy {
    type Object = Secret;
    const KIND: ResourceKind = ResourceKind::Secret;

    fn diff_typed(live: &mut Secret, desired: &Secret, changes: &mut Changes) {
        if desired.type_.is_some() {
            changes.immutable("secret type", &live.type_, &desired.type_);
        }
    }
}

pub struct RolePolicy;

impl TypedDiff for RolePolicy {
    type Object = Role;
    const KIND: ResourceKind = ResourceKind::Role;

    fn diff_typed(live: &mut Role, desired: &Role, changes: &mut Changes) {
        changes.sync_vec("policy rules", &mut live.rules, &desired.rules);
    }
}

pub struct ClusterRolePolicy;

impl TypedDiff for ClusterRolePolicy {
    type Object = ClusterRole;
    const KIND: ResourceKind = ResourceKind::ClusterRole;

    fn diff_typed(live: &mut ClusterRole, desired: &ClusterRole, changes: &mut Changes) {
        changes.sync_vec("policy rules", &mut live.rules, &desired.rules);
    }
}

pub struct RoleBindingPolicy;

impl TypedDiff for RoleBindingPolicy {
    type Object = RoleBinding;
    const KIND: ResourceKind = ResourceKind::RoleBinding;

    fn diff_typed(live: &mut RoleBinding, desired: &RoleBinding, changes: &mut Changes) {
        changes.immutable("role ref", &live.role_ref, &desired.role_ref);
        changes.sync_vec("subjects", &mut live.subjects, &desired.subjects);
    }
}

pub struct ClusterRoleBindingPolicy;

impl TypedDiff for ClusterRoleBindingPolicy {
    type Object = ClusterRoleBinding;
    const KIND: ResourceKind = ResourceKind::ClusterRoleBinding;

    fn diff_typed(
        live: &mut ClusterRoleBinding,
        desired: &ClusterRoleBinding,
        changes: &mut Changes,
    ) {
        changes.immutable("role ref", &live.role_ref, &desired.role_ref);
        changes.sync_vec("subjects", &mut live.subjects, &desired.subjects);
    }
}
