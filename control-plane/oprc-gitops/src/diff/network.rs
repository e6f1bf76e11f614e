use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::api::networking::v1::Ingress;

use super::{Changes, TypedDiff};
use crate::crd::route::Route;
use crate::store::ResourceKind;

pub struct ServicePolicy;

/// Ports compared without the server-assigned `nodePort`.
fn port_key(p: &ServicePort) -> ServicePort {
    ServicePort {
        node_port: None,
        ..p.clone()
    }
}

impl TypedDiff for ServicePolicy {
    type Object = Service;
    const KIND: ResourceKind = ResourceKind::Service;

    fn diff_typed(live: &mut Service, desired: &Service, changes: &mut Changes) {
        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        let spec = live.spec.get_or_insert_with(Default::default);
        changes.sync_set("service type", &mut spec.type_, &want.type_);
        changes.sync_set("selector", &mut spec.selector, &want.selector);

        let live_ports: Vec<ServicePort> =
            spec.ports.iter().flatten().map(port_key).collect();
        let want_ports: Vec<ServicePort> =
            want.ports.iter().flatten().map(port_key).collect();
        if live_ports != want_ports {
            // Keep allocated node ports for ports that survive the change.
            let mut ports = want.ports.clone().unwrap_or_default();
            for p in ports.iter_mut() {
                p.node_port = spec
                    .ports
                    .iter()
                    .flatten()
                    .find(|l| l.name == p.name && l.port == p.port)
                    .and_then(|l| l.node_port);
            }
            spec.ports = Some(ports);
            changes.push("ports");
        }
    }
}

pub struct IngressPolicy;

impl TypedDiff for IngressPolicy {
    type Object = Ingress;
    const KIND: ResourceKind = ResourceKind::Ingress;

    fn diff_typed(live: &mut Ingress, desired: &Ingress, changes: &mut Changes) {
        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        let spec = live.spec.get_or_insert_with(Default::default);
        changes.sync_set("ingress class", &mut spec.ingress_class_name, &want.ingress_class_name);
        changes.sync_vec("ingress host", &mut spec.rules, &want.rules);
        changes.sync_vec("ingress tls", &mut spec.tls, &want.tls);
    }
}

pub struct RoutePolicy;

/// Host and weight are only compared when rendered; the router assigns a
/// host and the API server defaults the weight.
impl TypedDiff for RoutePolicy {
    type Object = Route;
    const KIND: ResourceKind = ResourceKind::Route;

    fn diff_typed(live: &mut Route, desired: &Route, changes: &mut Changes) {
        let (spec, want) = (&mut live.spec, &desired.spec);
        changes.sync_set("route host", &mut spec.host, &want.host);
        changes.sync_set("route path", &mut spec.path, &want.path);

        let mut target = want.to.clone();
        if target.weight.is_none() {
            target.weight = spec.to.weight;
        }
        changes.sync("route target", &mut spec.to, &target);
        changes.sync("route port", &mut spec.port, &want.port);
        changes.sync("route tls", &mut spec.tls, &want.tls);
        changes.sync_set("wildcard policy", &mut spec.wildcard_policy, &want.wildcard_policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::route::{RoutePort, RouteSpec, RouteTargetReference, TlsConfig};
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn svc(type_: &str, node_port: Option<i32>, port: i32) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some(type_.into()),
                cluster_ip: Some("10.0.0.1".into()),
                ports: Some(vec![ServicePort {
                    name: Some("http".into()),
                    port,
                    target_port: Some(IntOrString::Int(8080)),
                    protocol: Some("TCP".into()),
                    node_port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_port_assignment_is_not_drift() {
        let mut live = svc("NodePort", Some(31000), 80);
        let mut changes = Changes::default();
        ServicePolicy::diff_typed(&mut live, &svc("NodePort", None, 80), &mut changes);
        assert!(changes.list.is_empty());
    }

    #[test]
    fn type_change_keeps_cluster_ip() {
        let mut live = svc("ClusterIP", None, 80);
        let mut desired = svc("LoadBalancer", None, 443);
        desired.spec.as_mut().unwrap().cluster_ip = None;
        let mut changes = Changes::default();
        ServicePolicy::diff_typed(&mut live, &desired, &mut changes);
        assert_eq!(changes.list, vec!["service type", "ports"]);
        assert_eq!(live.spec.unwrap().cluster_ip.as_deref(), Some("10.0.0.1"));
    }

    fn route(host: Option<&str>, weight: Option<i32>, termination: &str) -> Route {
        Route::new(
            "argo-server",
            RouteSpec {
                host: host.map(str::to_string),
                to: RouteTargetReference {
                    kind: "Service".into(),
                    name: "argo-server".into(),
                    weight,
                },
                port: Some(RoutePort {
                    target_port: IntOrString::String("https".into()),
                }),
                tls: Some(TlsConfig {
                    termination: termination.into(),
                    insecure_edge_termination_policy: Some("Redirect".into()),
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn router_assigned_host_and_default_weight_are_not_drift() {
        let mut live = route(Some("argo.apps.example.com"), Some(100), "passthrough");
        let mut changes = Changes::default();
        RoutePolicy::diff_typed(&mut live, &route(None, None, "passthrough"), &mut changes);
        assert!(changes.list.is_empty());
    }

    #[test]
    fn termination_and_host_changes_are_reported() {
        let mut live = route(None, Some(100), "passthrough");
        let desired = route(Some("argo.example.com"), None, "reencrypt");
        let mut changes = Changes::default();
        RoutePolicy::diff_typed(&mut live, &desired, &mut changes);
        assert_eq!(changes.list, vec!["route host", "route tls"]);
        assert_eq!(live.spec.to.weight, Some(100));
        assert_eq!(live.spec.host.as_deref(), Some("argo.example.com"));
    }
}
