use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, Volume, VolumeMount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding, RoleRef, Subject};

use super::ChildResourceDescriptor;
use super::common::{
    DEX_GRPC_PORT, DEX_HTTP_PORT, DEX_METRICS_PORT, Renderer, container_port, resources, strings,
    tcp_port,
};
use super::rbac::rule;
use crate::diff::append_unique_args;
use crate::store::{ResourceKind, StoreResult};

const COMPONENT: &str = "dex-server";
const SHARED_VOLUME: &str = "static-files";
const SHARED_PATH: &str = "/shared";
const OAUTH_REDIRECT_ANNOTATION: &str = "serviceaccounts.openshift.io/oauth-redirecturi.dex";

const KINDS: &[ResourceKind] = &[
    ResourceKind::ServiceAccount,
    ResourceKind::Role,
    ResourceKind::RoleBinding,
    ResourceKind::Deployment,
    ResourceKind::Service,
];

/// Dex identity broker, present only while Dex is the SSO provider. The
/// Dex binary is the Argo CD image's `argocd-dex` wrapper, copied into a
/// shared volume by an init container.
pub fn dex(r: &Renderer<'_>, out: &mut Vec<ChildResourceDescriptor>) -> StoreResult<()> {
    let name = r.child_name(COMPONENT);
    let Some(dex) = r.spec().dex() else {
        r.absent(out, KINDS, &name, COMPONENT, "dex is disabled");
        return Ok(());
    };

    let mut sa = r.service_account(&name, COMPONENT);
    let host = r.spec().ingress().and_then(|i| i.host.as_ref());
    if let (true, Some(host)) = (dex.openshift_oauth, host) {
        sa.metadata.annotations = Some(BTreeMap::from([(
            OAUTH_REDIRECT_ANNOTATION.to_string(),
            format!("https://{host}/api/dex/callback"),
        )]));
    }
    out.push(ChildResourceDescriptor::present(ResourceKind::ServiceAccount, COMPONENT, &sa)?);

    let role = Role {
        metadata: r.meta(&name, COMPONENT),
        rules: Some(vec![rule(&[""], &["secrets", "configmaps"], &["get", "list", "watch"])]),
    };
    let binding = RoleBinding {
        metadata: r.meta(&name, COMPONENT),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "Role".into(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: name.clone(),
            namespace: Some(r.namespace.clone()),
            ..Default::default()
        }]),
    };
    out.push(ChildResourceDescriptor::present(ResourceKind::Role, COMPONENT, &role)?);
    out.push(ChildResourceDescriptor::present(ResourceKind::RoleBinding, COMPONENT, &binding)?);

    let shared = VolumeMount {
        name: SHARED_VOLUME.into(),
        mount_path: SHARED_PATH.into(),
        ..Default::default()
    };
    let mut init = r.container("copyutil", r.core_image());
    init.command = Some(strings(&[
        "/bin/cp",
        "-n",
        "/usr/local/bin/argocd",
        "/shared/argocd-dex",
    ]));
    init.volume_mounts = Some(vec![shared.clone()]);

    let mut c = r.container("dex", r.dex_image(dex));
    c.command = Some(strings(&["/shared/argocd-dex", "rundex"]));
    c.args = Some(append_unique_args(&[], &dex.component.extra_command_args));
    c.env = r.env(&dex.component.env);
    c.resources = resources(dex.component.resources.as_ref());
    c.ports = Some(vec![
        container_port("http", DEX_HTTP_PORT),
        container_port("grpc", DEX_GRPC_PORT),
        container_port("metrics", DEX_METRICS_PORT),
    ]);
    c.volume_mounts = Some(vec![shared]);

    let mut pod = r.pod_spec(&name, vec![c]);
    pod.init_containers = Some(vec![init]);
    pod.volumes = Some(vec![Volume {
        name: SHARED_VOLUME.into(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }]);
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Deployment,
        COMPONENT,
        &r.deployment(&name, COMPONENT, dex.component.replicas.unwrap_or(1), pod),
    )?);
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Service,
        COMPONENT,
        &r.service(
            &name,
            COMPONENT,
            &name,
            vec![tcp_port("http", DEX_HTTP_PORT), tcp_port("grpc", DEX_GRPC_PORT)],
            None,
        ),
    )?);
    Ok(())
}
