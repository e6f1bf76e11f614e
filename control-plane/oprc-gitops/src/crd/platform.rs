use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespaced platform instance. Children land in its own namespace.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "gitops.oaas.io",
    version = "v1beta1",
    kind = "GitOpsPlatform",
    plural = "gitopsplatforms",
    shortname = "gop",
    namespaced,
    status = "PlatformStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
pub struct GitOpsPlatformSpec {
    #[serde(flatten)]
    pub common: PlatformCommonSpec,
}

/// Cluster-scoped platform instance. Children land in
/// `controlPlaneNamespace` and the instance may run an agent.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "gitops.oaas.io",
    version = "v1beta1",
    kind = "ClusterGitOpsPlatform",
    plural = "clustergitopsplatforms",
    shortname = "cgop",
    status = "PlatformStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGitOpsPlatformSpec {
    #[serde(flatten)]
    pub common: PlatformCommonSpec,
    /// Namespace receiving the workloads (default "gitops")
    pub control_plane_namespace: Option<String>,
    pub agent: Option<AgentSpec>,
}

pub const DEFAULT_CONTROL_PLANE_NAMESPACE: &str = "gitops";

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformCommonSpec {
    /// Core image repository; the operator default applies when unset
    pub image: Option<String>,
    /// Image tag appended to `image`
    pub version: Option<String>,
    pub image_pull_policy: Option<String>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub ha: HaSpec,
    pub cache: Option<CacheSpec>,
    #[serde(default)]
    pub tls: TlsSpec,
    #[serde(default)]
    pub server: ServerSpec,
    #[serde(default)]
    pub repo: ComponentSpec,
    #[serde(default)]
    pub controller: ComponentSpec,
    pub application_set: Option<ApplicationSetSpec>,
    pub notifications: Option<NotificationsSpec>,
    /// Namespaces (or `*` patterns) whose Applications this instance manages
    #[serde(default)]
    pub source_namespaces: Vec<String>,
    pub node_placement: Option<NodePlacementSpec>,
    #[serde(default)]
    pub local_users: Vec<LocalUserSpec>,
    /// Prometheus scrape hints on component pods
    pub monitoring: Option<MonitoringSpec>,
    pub sso: Option<SsoSpec>,
}

impl PlatformCommonSpec {
    pub fn ha_enabled(&self) -> bool {
        self.ha.enabled
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.as_ref().and_then(|c| c.enabled).unwrap_or(true)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.enabled
    }

    pub fn appset_enabled(&self) -> bool {
        self.application_set
            .as_ref()
            .is_some_and(|a| a.enabled.unwrap_or(true))
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications.as_ref().is_some_and(|n| n.enabled)
    }

    pub fn ingress(&self) -> Option<&IngressSpec> {
        self.server.ingress.as_ref().filter(|i| i.enabled)
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().is_some_and(|m| m.enabled)
    }

    /// Dex settings when Dex is the SSO provider.
    pub fn dex(&self) -> Option<&DexSpec> {
        self.sso
            .as_ref()
            .filter(|s| s.provider == SsoProvider::Dex)
            .map(|s| &s.dex)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct MonitoringSpec {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct SsoSpec {
    pub provider: SsoProvider,
    #[serde(default)]
    pub dex: DexSpec,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SsoProvider {
    #[default]
    Dex,
    /// SSO handled by an external OIDC provider configured in Argo CD
    Oidc,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DexSpec {
    /// Dex image; the operator default applies when unset
    pub image: Option<String>,
    /// Let Dex log in through the OpenShift OAuth server
    #[serde(default)]
    pub openshift_oauth: bool,
    #[serde(flatten)]
    pub component: ComponentSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct HaSpec {
    #[serde(default)]
    pub enabled: bool,
    pub resources: Option<ResourceSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct CacheSpec {
    /// Defaults to true
    pub enabled: Option<bool>,
    pub image: Option<String>,
    pub resources: Option<ResourceSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TlsSpec {
    /// Serve the cache over TLS using the `<name>-cache-tls` secret
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub replicas: Option<i32>,
    pub resources: Option<ResourceSpec>,
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,
    #[serde(default)]
    pub extra_command_args: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    /// ClusterIP | NodePort | LoadBalancer
    pub service_type: Option<String>,
    pub ingress: Option<IngressSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    #[serde(default)]
    pub enabled: bool,
    pub host: Option<String>,
    pub ingress_class_name: Option<String>,
    pub tls_secret_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSpec {
    /// Defaults to true when the block is present
    pub enabled: Option<bool>,
    #[serde(default)]
    pub source_namespaces: Vec<String>,
    #[serde(flatten)]
    pub component: ComponentSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub source_namespaces: Vec<String>,
    #[serde(flatten)]
    pub component: ComponentSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    #[serde(default)]
    pub enabled: bool,
    pub image: Option<String>,
    /// Address of the principal the agent connects to
    pub principal_address: Option<String>,
    #[serde(flatten)]
    pub component: ComponentSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacementSpec {
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub tolerations: Vec<TolerationSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TolerationSpec {
    pub key: Option<String>,
    pub operator: Option<String>,
    pub value: Option<String>,
    pub effect: Option<String>,
    pub toleration_seconds: Option<i64>,
}

/// Quantities keyed by resource name, e.g. `{"cpu": "250m"}`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ResourceSpec {
    pub requests: Option<BTreeMap<String, String>>,
    pub limits: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct EnvVarSpec {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalUserSpec {
    pub name: String,
    /// Defaults to true
    pub enabled: Option<bool>,
    /// Token lifetime; 0 or unset means the token never expires
    pub token_lifetime_secs: Option<u64>,
    #[serde(default)]
    pub auto_renew: bool,
}

impl LocalUserSpec {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn lifetime(&self) -> Option<std::time::Duration> {
        self.token_lifetime_secs
            .filter(|s| *s > 0)
            .map(std::time::Duration::from_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    pub phase: Option<Phase>,
    pub message: Option<String>,
    pub observed_generation: Option<i64>,
    pub last_updated: Option<String>,
    /// Content checksums feeding pod-template annotations
    pub checksums: Option<BTreeMap<String, String>>,
    pub conditions: Option<Vec<Condition>>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
    Pending,
    Available,
    Failed,
    Unknown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Available => "Available",
            Phase::Failed => "Failed",
            Phase::Unknown => "Unknown",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    Reconciled,
    Degraded,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn common_spec_defaults() {
        let spec: PlatformCommonSpec = serde_json::from_value(json!({})).unwrap();
        assert!(spec.cache_enabled());
        assert!(!spec.ha_enabled());
        assert!(!spec.appset_enabled());
        assert!(!spec.notifications_enabled());
        assert!(spec.ingress().is_none());
    }

    #[test]
    fn cluster_spec_flattens_common_fields() {
        let spec: ClusterGitOpsPlatformSpec = serde_json::from_value(json!({
            "ha": {"enabled": true},
            "applicationSet": {"sourceNamespaces": ["team-*"]},
            "server": {"replicas": 2, "extraCommandArgs": ["--insecure"]},
            "controlPlaneNamespace": "argo",
            "agent": {"enabled": true, "principalAddress": "principal:8443"}
        }))
        .unwrap();
        assert!(spec.common.ha_enabled());
        assert!(spec.common.appset_enabled());
        assert_eq!(spec.common.server.component.replicas, Some(2));
        assert_eq!(spec.control_plane_namespace.as_deref(), Some("argo"));
        assert!(spec.agent.unwrap().enabled);
    }

    #[test]
    fn dex_applies_only_to_dex_provider() {
        let spec: PlatformCommonSpec = serde_json::from_value(json!({
            "sso": {"provider": "dex", "dex": {"openshiftOauth": true, "replicas": 2}},
            "monitoring": {"enabled": true}
        }))
        .unwrap();
        let dex = spec.dex().unwrap();
        assert!(dex.openshift_oauth);
        assert_eq!(dex.component.replicas, Some(2));
        assert!(spec.monitoring_enabled());

        let oidc: PlatformCommonSpec =
            serde_json::from_value(json!({"sso": {"provider": "oidc"}})).unwrap();
        assert!(oidc.dex().is_none());
        assert!(!oidc.monitoring_enabled());
    }

    #[test]
    fn phase_serializes_pascal_case() {
        let status = PlatformStatus {
            phase: Some(Phase::Available),
            ..Default::default()
        };
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["phase"], "Available");
    }
}
