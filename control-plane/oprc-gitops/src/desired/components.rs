use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::ChildResourceDescriptor;
use super::common::{
    APPSET_WEBHOOK_PORT, REPO_SERVER_PORT, Renderer, SERVER_PORT, container_port, resources,
    strings, tcp_port,
};
use crate::apis::Exposure;
use crate::crd::ClaimKind;
use crate::crd::platform::{ComponentSpec, IngressSpec as ExposureSpec};
use crate::crd::route::{Route, RoutePort, RouteSpec, RouteTargetReference, TlsConfig};
use crate::diff::append_unique_args;
use crate::store::{ResourceKind, StoreResult};

type Out = Vec<ChildResourceDescriptor>;

const WORKLOAD: &[ResourceKind] = &[
    ResourceKind::ServiceAccount,
    ResourceKind::Deployment,
    ResourceKind::Service,
];

fn with_cache_args(r: &Renderer<'_>, mut base: Vec<String>) -> Vec<String> {
    if let Some(addr) = r.cache_address() {
        base.extend(["--redis".to_string(), addr]);
        if r.spec().tls_enabled() {
            base.push("--redis-use-tls".into());
        }
    }
    base
}

fn with_namespaces(mut base: Vec<String>, flag: &str, patterns: Vec<String>) -> Vec<String> {
    if !patterns.is_empty() {
        base.extend([flag.to_string(), patterns.join(",")]);
    }
    base
}

fn ingress(r: &Renderer<'_>, name: &str, ing: &ExposureSpec) -> Ingress {
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: name.to_string(),
            port: Some(ServiceBackendPort {
                name: Some("http".into()),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };
    Ingress {
        metadata: r.meta(name, "server"),
        spec: Some(IngressSpec {
            ingress_class_name: ing.ingress_class_name.clone(),
            rules: Some(vec![IngressRule {
                host: ing.host.clone(),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".into()),
                        path_type: "Prefix".into(),
                        backend,
                    }],
                }),
            }]),
            tls: ing.tls_secret_name.as_ref().map(|secret| {
                vec![IngressTLS {
                    hosts: ing.host.clone().map(|h| vec![h]),
                    secret_name: Some(secret.clone()),
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Passthrough Route to the server's https port; the server terminates TLS.
fn route(r: &Renderer<'_>, name: &str, ing: &ExposureSpec) -> Route {
    let mut route = Route::new(
        name,
        RouteSpec {
            host: ing.host.clone(),
            path: None,
            to: RouteTargetReference {
                kind: "Service".into(),
                name: name.to_string(),
                weight: Some(100),
            },
            port: Some(RoutePort {
                target_port: IntOrString::String("https".into()),
            }),
            tls: Some(TlsConfig {
                termination: "passthrough".into(),
                insecure_edge_termination_policy: Some("Redirect".into()),
            }),
            wildcard_policy: Some("None".into()),
        },
    );
    route.metadata = r.meta(name, "server");
    route
}

fn component_container(
    r: &Renderer<'_>,
    name: &str,
    image: String,
    command: &[&str],
    base_args: Vec<String>,
    spec: &ComponentSpec,
) -> Container {
    let mut c = r.container(name, image);
    c.command = Some(strings(command));
    c.args = Some(append_unique_args(&base_args, &spec.extra_command_args));
    c.env = r.env(&spec.env);
    c.resources = resources(spec.resources.as_ref());
    c
}

pub fn server(r: &Renderer<'_>, out: &mut Out) -> StoreResult<()> {
    let spec = &r.spec().server;
    let name = r.child_name("server");
    let mut base = with_namespaces(
        with_cache_args(
            r,
            vec![
                "--loglevel".into(),
                r.log_level(),
                "--repo-server".into(),
                r.repo_address(),
            ],
        ),
        "--application-namespaces",
        r.instance.source_namespaces(ClaimKind::Apps),
    );
    if r.spec().dex().is_some() {
        base.extend(["--dex-server".to_string(), r.dex_address()]);
    }
    let mut c = component_container(r, "server", r.core_image(), &["argocd-server"], base, &spec.component);
    c.ports = Some(vec![container_port("server", SERVER_PORT)]);
    let pod = r.pod_spec(&name, vec![c]);

    out.push(ChildResourceDescriptor::present(
        ResourceKind::ServiceAccount,
        "server",
        &r.service_account(&name, "server"),
    )?);
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Deployment,
        "server",
        &r.deployment(&name, "server", spec.component.replicas.unwrap_or(1), pod),
    )?);
    let mut http = tcp_port("http", 80);
    http.target_port = Some(IntOrString::Int(SERVER_PORT));
    let mut https = tcp_port("https", 443);
    https.target_port = Some(IntOrString::Int(SERVER_PORT));
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Service,
        "server",
        &r.service(&name, "server", &name, vec![http, https], spec.service_type.clone()),
    )?);

    match (r.spec().ingress(), r.exposure) {
        (Some(ing), Exposure::Route) => {
            out.push(ChildResourceDescriptor::present(
                ResourceKind::Route,
                "server",
                &route(r, &name, ing),
            )?);
            r.absent(out, &[ResourceKind::Ingress], &name, "server", "route is served instead");
        }
        (Some(ing), Exposure::Ingress) => {
            out.push(ChildResourceDescriptor::present(
                ResourceKind::Ingress,
                "server",
                &ingress(r, &name, ing),
            )?);
        }
        (None, Exposure::Route) => r.absent(
            out,
            &[ResourceKind::Route, ResourceKind::Ingress],
            &name,
            "server",
            "ingress is disabled",
        ),
        // No Route descriptor at all: the API is not served here.
        (None, Exposure::Ingress) => {
            r.absent(out, &[ResourceKind::Ingress], &name, "server", "ingress is disabled")
        }
    }
    Ok(())
}

pub fn repo_server(r: &Renderer<'_>, out: &mut Out) -> StoreResult<()> {
    let spec = &r.spec().repo;
    let name = r.child_name("repo-server");
    let base = with_cache_args(r, vec!["--loglevel".into(), r.log_level()]);
    let mut c = component_container(r, "repo-server", r.core_image(), &["argocd-repo-server"], base, spec);
    c.ports = Some(vec![container_port("server", REPO_SERVER_PORT)]);
    let pod = r.pod_spec(&name, vec![c]);

    out.push(ChildResourceDescriptor::present(
        ResourceKind::ServiceAccount,
        "repo-server",
        &r.service_account(&name, "repo-server"),
    )?);
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Deployment,
        "repo-server",
        &r.deployment(&name, "repo-server", spec.replicas.unwrap_or(1), pod),
    )?);
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Service,
        "repo-server",
        &r.service(&name, "repo-server", &name, vec![tcp_port("server", REPO_SERVER_PORT)], None),
    )?);
    Ok(())
}

pub fn application_controller(r: &Renderer<'_>, out: &mut Out) -> StoreResult<()> {
    let spec = &r.spec().controller;
    let name = r.child_name("application-controller");
    let base = with_namespaces(
        with_cache_args(
            r,
            vec![
                "--operation-processors".into(),
                "10".into(),
                "--status-processors".into(),
                "20".into(),
                "--loglevel".into(),
                r.log_level(),
                "--repo-server".into(),
                r.repo_address(),
            ],
        ),
        "--application-namespaces",
        r.instance.source_namespaces(ClaimKind::Apps),
    );
    let c = component_container(
        r,
        "application-controller",
        r.core_image(),
        &["argocd-application-controller"],
        base,
        spec,
    );
    let pod = r.pod_spec(&name, vec![c]);

    out.push(ChildResourceDescriptor::present(
        ResourceKind::ServiceAccount,
        "application-controller",
        &r.service_account(&name, "application-controller"),
    )?);
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Deployment,
        "application-controller",
        &r.deployment(&name, "application-controller", spec.replicas.unwrap_or(1), pod),
    )?);
    Ok(())
}

pub fn applicationset_controller(r: &Renderer<'_>, out: &mut Out) -> StoreResult<()> {
    let name = r.child_name("applicationset-controller");
    let component = "applicationset-controller";
    let Some(appset) = r.spec().application_set.as_ref().filter(|_| r.spec().appset_enabled()) else {
        r.absent(out, WORKLOAD, &name, component, "applicationset is disabled");
        return Ok(());
    };
    let base = with_namespaces(
        vec!["--loglevel".into(), r.log_level()],
        "--applicationset-namespaces",
        r.instance.source_namespaces(ClaimKind::AppSets),
    );
    let mut c = component_container(
        r,
        component,
        r.core_image(),
        &["entrypoint.sh", "argocd-applicationset-controller"],
        base,
        &appset.component,
    );
    c.ports = Some(vec![container_port("webhook", APPSET_WEBHOOK_PORT)]);
    let pod = r.pod_spec(&name, vec![c]);

    out.push(ChildResourceDescriptor::present(
        ResourceKind::ServiceAccount,
        component,
        &r.service_account(&name, component),
    )?);
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Deployment,
        component,
        &r.deployment(&name, component, appset.component.replicas.unwrap_or(1), pod),
    )?);
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Service,
        component,
        &r.service(&name, component, &name, vec![tcp_port("webhook", APPSET_WEBHOOK_PORT)], None),
    )?);
    Ok(())
}

pub fn notifications_controller(r: &Renderer<'_>, out: &mut Out) -> StoreResult<()> {
    let name = r.child_name("notifications-controller");
    let component = "notifications-controller";
    let kinds = &[ResourceKind::ServiceAccount, ResourceKind::Deployment];
    let Some(notif) = r.spec().notifications.as_ref().filter(|n| n.enabled) else {
        r.absent(out, kinds, &name, component, "notifications are disabled");
        return Ok(());
    };
    let mut base = with_namespaces(
        vec!["--loglevel".into(), r.log_level()],
        "--application-namespaces",
        r.instance.source_namespaces(ClaimKind::Apps),
    );
    if !r.instance.source_namespaces(ClaimKind::Notifications).is_empty() {
        base.push("--self-service-notification-enabled".into());
    }
    let c = component_container(
        r,
        component,
        r.core_image(),
        &["argocd-notifications"],
        base,
        &notif.component,
    );
    let pod = r.pod_spec(&name, vec![c]);

    out.push(ChildResourceDescriptor::present(
        ResourceKind::ServiceAccount,
        component,
        &r.service_account(&name, component),
    )?);
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Deployment,
        component,
        &r.deployment(&name, component, 1, pod),
    )?);
    Ok(())
}

/// Only cluster-scoped instances run an agent.
pub fn agent(r: &Renderer<'_>, out: &mut Out) -> StoreResult<()> {
    if !r.instance.is_cluster_scoped() {
        return Ok(());
    }
    let name = r.child_name("agent");
    let kinds = &[ResourceKind::ServiceAccount, ResourceKind::Deployment];
    let Some(agent) = r.instance.agent() else {
        r.absent(out, kinds, &name, "agent", "agent is disabled");
        return Ok(());
    };
    let mut base = vec!["agent".to_string(), "--log-level".into(), r.log_level()];
    if let Some(addr) = agent.principal_address.as_ref() {
        base.extend(["--server-address".to_string(), addr.clone()]);
    }
    if let Some(addr) = r.cache_address() {
        base.extend(["--redis-addr".to_string(), addr]);
    }
    let image = agent.image.clone().unwrap_or_else(|| r.core_image());
    let c = component_container(r, "agent", image, &["argocd-agent"], base, &agent.component);
    let pod = r.pod_spec(&name, vec![c]);

    out.push(ChildResourceDescriptor::present(
        ResourceKind::ServiceAccount,
        "agent",
        &r.service_account(&name, "agent"),
    )?);
    out.push(ChildResourceDescriptor::present(
        ResourceKind::Deployment,
        "agent",
        &r.deployment(&name, "agent", agent.component.replicas.unwrap_or(1), pod),
    )?);
    Ok(())
}
