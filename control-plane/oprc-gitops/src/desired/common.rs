use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret, SeccompProfile, SecurityContext, Service,
    ServiceAccount, ServicePort, ServiceSpec, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sha2::{Digest, Sha256};

use super::{BuildContext, BuilderDefaults, ChildResourceDescriptor};
use crate::apis::Exposure;
use crate::crd::ManagedInstance;
use crate::crd::platform::{DexSpec, EnvVarSpec, PlatformCommonSpec, ResourceSpec};
use crate::labels::{
    ANNOTATION_CACHE_TLS_CHECKSUM, ANNOTATION_PROMETHEUS_PATH, ANNOTATION_PROMETHEUS_PORT,
    ANNOTATION_PROMETHEUS_SCRAPE, LABEL_MONITORING, LABEL_NAME, child_labels,
};
use crate::store::ResourceKind;

pub const CACHE_PORT: i32 = 6379;
pub const SENTINEL_PORT: i32 = 26379;
pub const REPO_SERVER_PORT: i32 = 8081;
pub const SERVER_PORT: i32 = 8080;
pub const APPSET_WEBHOOK_PORT: i32 = 7000;
pub const DEX_HTTP_PORT: i32 = 5556;
pub const DEX_GRPC_PORT: i32 = 5557;
pub const DEX_METRICS_PORT: i32 = 5558;

/// Metrics port of each component that serves Prometheus metrics.
fn metrics_port(component: &str) -> Option<i32> {
    match component {
        "application-controller" => Some(8082),
        "server" => Some(8083),
        "repo-server" => Some(8084),
        "applicationset-controller" => Some(8080),
        "notifications-controller" => Some(9001),
        "dex-server" => Some(DEX_METRICS_PORT),
        _ => None,
    }
}

/// Proxy settings propagated from the operator's own environment.
#[derive(Clone, Debug, Default)]
pub struct ProxyEnv {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxyEnv {
    fn vars(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("HTTP_PROXY", self.http_proxy.as_deref()),
            ("HTTPS_PROXY", self.https_proxy.as_deref()),
            ("NO_PROXY", self.no_proxy.as_deref()),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.filter(|v| !v.is_empty()).map(|v| (k, v)))
    }
}

/// Stable digest of a secret's payload; key order does not matter.
pub fn tls_checksum(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in secret.data.iter().flatten() {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(&v.0);
        hasher.update(b"\n");
    }
    for (k, v) in secret.string_data.iter().flatten() {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".into()]),
            ..Default::default()
        }),
        read_only_root_filesystem: Some(true),
        run_as_non_root: Some(true),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(map: Option<&BTreeMap<String, String>>) -> Option<BTreeMap<String, Quantity>> {
    map.filter(|m| !m.is_empty()).map(|m| {
        m.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect()
    })
}

pub fn resources(spec: Option<&ResourceSpec>) -> Option<ResourceRequirements> {
    let spec = spec?;
    let req = ResourceRequirements {
        requests: quantities(spec.requests.as_ref()),
        limits: quantities(spec.limits.as_ref()),
        ..Default::default()
    };
    (req.requests.is_some() || req.limits.is_some()).then_some(req)
}

pub fn tcp_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.into()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

pub fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.into()),
        container_port: port,
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Per-pass rendering helpers bound to one instance.
pub struct Renderer<'a> {
    pub instance: &'a dyn ManagedInstance,
    pub defaults: &'a BuilderDefaults,
    pub tls_checksum: Option<&'a str>,
    pub exposure: Exposure,
    pub name: String,
    pub namespace: String,
    id_label: String,
}

impl<'a> Renderer<'a> {
    pub fn new(ctx: &'a BuildContext<'a>, defaults: &'a BuilderDefaults) -> Self {
        Self {
            instance: ctx.instance,
            defaults,
            tls_checksum: ctx.tls_checksum.as_deref(),
            exposure: ctx.exposure,
            name: ctx.instance.name(),
            namespace: ctx.instance.target_namespace(),
            id_label: ctx.instance.id().label_value(),
        }
    }

    pub fn spec(&self) -> &PlatformCommonSpec {
        self.instance.common()
    }

    pub fn child_name(&self, component: &str) -> String {
        format!("{}-{}", self.name, component)
    }

    pub fn meta(&self, name: &str, component: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(child_labels(&self.id_label, name, component)),
            ..Default::default()
        }
    }

    pub fn cluster_meta(&self, name: &str, component: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(child_labels(&self.id_label, name, component)),
            ..Default::default()
        }
    }

    pub fn selector(&self, name: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some(BTreeMap::from([(LABEL_NAME.to_string(), name.to_string())])),
            ..Default::default()
        }
    }

    /// `image[:version]`; a bare version retags the operator default.
    pub fn core_image(&self) -> String {
        let spec = self.spec();
        match (spec.image.as_deref(), spec.version.as_deref()) {
            (Some(img), Some(ver)) => format!("{img}:{ver}"),
            (Some(img), None) => img.to_string(),
            (None, Some(ver)) => {
                let repo = self
                    .defaults
                    .image
                    .rsplit_once(':')
                    .map(|(repo, _)| repo)
                    .unwrap_or(&self.defaults.image);
                format!("{repo}:{ver}")
            }
            (None, None) => self.defaults.image.clone(),
        }
    }

    pub fn cache_image(&self) -> String {
        self.spec()
            .cache
            .as_ref()
            .and_then(|c| c.image.clone())
            .unwrap_or_else(|| self.defaults.cache_image.clone())
    }

    pub fn dex_image(&self, dex: &DexSpec) -> String {
        dex.image
            .clone()
            .unwrap_or_else(|| self.defaults.dex_image.clone())
    }

    pub fn dex_address(&self) -> String {
        format!(
            "http://{}.{}.svc.cluster.local:{DEX_HTTP_PORT}",
            self.child_name("dex-server"),
            self.namespace
        )
    }

    pub fn log_level(&self) -> String {
        self.spec().log_level.clone().unwrap_or_else(|| "info".into())
    }

    /// Address other components use to reach the cache, if it runs.
    pub fn cache_address(&self) -> Option<String> {
        let spec = self.spec();
        if !spec.cache_enabled() {
            return None;
        }
        let svc = if spec.ha_enabled() {
            self.child_name("cache-ha")
        } else {
            self.child_name("cache")
        };
        Some(format!("{svc}.{}.svc.cluster.local:{CACHE_PORT}", self.namespace))
    }

    pub fn repo_address(&self) -> String {
        format!(
            "{}.{}.svc.cluster.local:{REPO_SERVER_PORT}",
            self.child_name("repo-server"),
            self.namespace
        )
    }

    /// User env first, then proxy vars the user did not set explicitly.
    pub fn env(&self, user: &[EnvVarSpec]) -> Option<Vec<EnvVar>> {
        let mut env: Vec<EnvVar> = user
            .iter()
            .map(|e| EnvVar {
                name: e.name.clone(),
                value: e.value.clone(),
                ..Default::default()
            })
            .collect();
        for (name, value) in self.defaults.proxy.vars() {
            if !env.iter().any(|e| e.name == name) {
                env.push(EnvVar {
                    name: name.to_string(),
                    value: Some(value.to_string()),
                    ..Default::default()
                });
            }
        }
        (!env.is_empty()).then_some(env)
    }

    pub fn container(&self, name: &str, image: String) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image),
            image_pull_policy: self.spec().image_pull_policy.clone(),
            security_context: Some(restricted_security_context()),
            ..Default::default()
        }
    }

    pub fn pod_spec(&self, service_account: &str, containers: Vec<Container>) -> PodSpec {
        let placement = self.spec().node_placement.as_ref();
        let tolerations: Vec<Toleration> = placement
            .map(|p| {
                p.tolerations
                    .iter()
                    .map(|t| Toleration {
                        key: t.key.clone(),
                        operator: t.operator.clone(),
                        value: t.value.clone(),
                        effect: t.effect.clone(),
                        toleration_seconds: t.toleration_seconds,
                    })
                    .collect()
            })
            .unwrap_or_default();
        PodSpec {
            service_account_name: Some(service_account.to_string()),
            containers,
            node_selector: placement
                .and_then(|p| p.node_selector.clone())
                .filter(|m| !m.is_empty()),
            tolerations: (!tolerations.is_empty()).then_some(tolerations),
            ..Default::default()
        }
    }

    /// Pod template carrying the cache TLS checksum when one is known, and
    /// scrape hints when monitoring is on.
    pub fn pod_template(&self, name: &str, component: &str, spec: PodSpec) -> PodTemplateSpec {
        let mut labels = child_labels(&self.id_label, name, component);
        let mut annotations = BTreeMap::new();
        if let Some(sum) = self.tls_checksum {
            annotations.insert(ANNOTATION_CACHE_TLS_CHECKSUM.to_string(), sum.to_string());
        }
        let scraped = metrics_port(component).filter(|_| self.spec().monitoring_enabled());
        if let Some(port) = scraped {
            annotations.insert(ANNOTATION_PROMETHEUS_SCRAPE.to_string(), "true".to_string());
            annotations.insert(ANNOTATION_PROMETHEUS_PORT.to_string(), port.to_string());
            annotations.insert(ANNOTATION_PROMETHEUS_PATH.to_string(), "/metrics".to_string());
            labels.insert(LABEL_MONITORING.to_string(), "enabled".to_string());
        }
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                annotations: (!annotations.is_empty()).then_some(annotations),
                ..Default::default()
            }),
            spec: Some(spec),
        }
    }

    pub fn deployment(
        &self,
        name: &str,
        component: &str,
        replicas: i32,
        spec: PodSpec,
    ) -> Deployment {
        Deployment {
            metadata: self.meta(name, component),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: self.selector(name),
                template: self.pod_template(name, component, spec),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn service(
        &self,
        name: &str,
        component: &str,
        target: &str,
        ports: Vec<ServicePort>,
        type_: Option<String>,
    ) -> Service {
        Service {
            metadata: self.meta(name, component),
            spec: Some(ServiceSpec {
                type_: Some(type_.unwrap_or_else(|| "ClusterIP".into())),
                selector: self.selector(target).match_labels,
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn service_account(&self, name: &str, component: &str) -> ServiceAccount {
        ServiceAccount {
            metadata: self.meta(name, component),
            ..Default::default()
        }
    }

    /// Absent descriptors for a namespaced component's objects.
    pub fn absent(
        &self,
        out: &mut Vec<ChildResourceDescriptor>,
        kinds: &[ResourceKind],
        name: &str,
        component: &'static str,
        reason: &str,
    ) {
        for kind in kinds {
            out.push(ChildResourceDescriptor::absent(
                *kind,
                Some(&self.namespace),
                name,
                component,
                reason,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    #[test]
    fn checksum_is_stable_and_content_sensitive() {
        let mut s = Secret {
            data: Some(BTreeMap::from([
                ("tls.crt".to_string(), ByteString(b"cert".to_vec())),
                ("tls.key".to_string(), ByteString(b"key".to_vec())),
            ])),
            ..Default::default()
        };
        let a = tls_checksum(&s);
        assert_eq!(a, tls_checksum(&s.clone()));
        assert_eq!(a.len(), 64);
        s.data
            .as_mut()
            .unwrap()
            .insert("tls.key".into(), ByteString(b"rotated".to_vec()));
        assert_ne!(a, tls_checksum(&s));
    }

    #[test]
    fn empty_resource_spec_renders_nothing() {
        assert!(resources(Some(&ResourceSpec::default())).is_none());
        let r = resources(Some(&ResourceSpec {
            limits: Some(BTreeMap::from([("cpu".into(), "500m".into())])),
            requests: None,
        }))
        .unwrap();
        assert_eq!(r.limits.unwrap()["cpu"], Quantity("500m".into()));
    }

    #[test]
    fn proxy_vars_skip_unset_values() {
        let p = ProxyEnv {
            http_proxy: Some("http://proxy:3128".into()),
            https_proxy: Some(String::new()),
            no_proxy: None,
        };
        let vars: Vec<_> = p.vars().collect();
        assert_eq!(vars, vec![("HTTP_PROXY", "http://proxy:3128")]);
    }
}
