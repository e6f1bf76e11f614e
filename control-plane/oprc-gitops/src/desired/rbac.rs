use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};

use super::ChildResourceDescriptor;
use super::common::{Renderer, strings};
use crate::controller::ownership::OwnershipRegistrar;
use crate::store::{ResourceKind, StoreResult};

pub(super) fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(strings(groups)),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..Default::default()
    }
}

fn controller_rules() -> Vec<PolicyRule> {
    vec![
        rule(&["*"], &["*"], &["get", "list", "watch"]),
        rule(&[""], &["events"], &["create", "patch"]),
    ]
}

fn server_rules() -> Vec<PolicyRule> {
    vec![
        rule(&["*"], &["*"], &["get", "delete", "patch"]),
        rule(&[""], &["events"], &["create", "list"]),
        rule(&[""], &["pods", "pods/log"], &["get"]),
        rule(
            &["argoproj.io"],
            &["applications", "applicationsets", "appprojects"],
            &["create", "get", "list", "watch", "update", "delete", "patch"],
        ),
    ]
}

/// ClusterRole and ClusterRoleBinding for the two components that read
/// across the whole cluster. Names come from the registrar so instances in
/// different namespaces never collide.
pub fn cluster_rbac(r: &Renderer<'_>, out: &mut Vec<ChildResourceDescriptor>) -> StoreResult<()> {
    for (component, rules) in [
        ("application-controller", controller_rules()),
        ("server", server_rules()),
    ] {
        let name = OwnershipRegistrar::cluster_scoped_name(r.instance, component);
        let role = ClusterRole {
            metadata: r.cluster_meta(&name, component),
            rules: Some(rules),
            ..Default::default()
        };
        let binding = ClusterRoleBinding {
            metadata: r.cluster_meta(&name, component),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: name.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: r.child_name(component),
                namespace: Some(r.namespace.clone()),
                ..Default::default()
            }]),
        };
        out.push(ChildResourceDescriptor::present(ResourceKind::ClusterRole, component, &role)?);
        out.push(ChildResourceDescriptor::present(
            ResourceKind::ClusterRoleBinding,
            component,
            &binding,
        )?);
    }
    Ok(())
}
