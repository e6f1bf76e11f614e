use std::time::Duration;

use envconfig::Envconfig;

use crate::controller::EngineSettings;
use crate::desired::{BuilderDefaults, ProxyEnv};

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    #[envconfig(from = "OPRC_GITOPS_PROFILE", default = "dev")]
    pub profile: String,

    /// Only instances whose labels match are reconciled. Empty matches all.
    /// Env: OPRC_GITOPS_LABEL_SELECTOR
    #[envconfig(from = "OPRC_GITOPS_LABEL_SELECTOR", default = "")]
    pub label_selector: String,

    #[envconfig(from = "OPRC_GITOPS_WORKERS", default = "4")]
    pub workers: u16,

    #[envconfig(from = "OPRC_GITOPS_STORE_TIMEOUT_SECS", default = "30")]
    pub store_timeout_secs: u64,

    #[envconfig(from = "OPRC_GITOPS_RESYNC_SECS", default = "300")]
    pub resync_secs: u64,

    #[envconfig(from = "OPRC_GITOPS_CONFLICT_REQUEUE_SECS", default = "5")]
    pub conflict_requeue_secs: u64,

    #[envconfig(from = "OPRC_GITOPS_ERROR_REQUEUE_SECS", default = "60")]
    pub error_requeue_secs: u64,

    #[envconfig(
        from = "OPRC_GITOPS_IMAGE",
        default = "quay.io/argoproj/argocd:v2.14.2"
    )]
    pub image: String,

    #[envconfig(from = "OPRC_GITOPS_CACHE_IMAGE", default = "redis:7.2.7-alpine")]
    pub cache_image: String,

    #[envconfig(from = "OPRC_GITOPS_DEX_IMAGE", default = "ghcr.io/dexidp/dex:v2.41.1")]
    pub dex_image: String,

    /// How often cached API discovery answers are dropped, so a Route API
    /// installed after startup is picked up. Env: OPRC_GITOPS_API_REFRESH_SECS
    #[envconfig(from = "OPRC_GITOPS_API_REFRESH_SECS", default = "600")]
    pub api_refresh_secs: u64,

    #[envconfig(nested)]
    pub features: FeaturesConfig,

    #[envconfig(nested)]
    pub proxy: ProxyConfig,
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct FeaturesConfig {
    /// If Some, env explicitly set; otherwise, profile defaults apply
    #[envconfig(from = "OPRC_GITOPS_FEATURES_NAMESPACED")]
    pub namespaced: Option<bool>,
    #[envconfig(from = "OPRC_GITOPS_FEATURES_CLUSTER_SCOPED")]
    pub cluster_scoped: Option<bool>,
}

/// Proxy settings copied into every workload container.
#[derive(Envconfig, Clone, Debug, Default)]
pub struct ProxyConfig {
    #[envconfig(from = "HTTP_PROXY")]
    pub http_proxy: Option<String>,
    #[envconfig(from = "HTTPS_PROXY")]
    pub https_proxy: Option<String>,
    #[envconfig(from = "NO_PROXY")]
    pub no_proxy: Option<String>,
}

impl OperatorConfig {
    /// Apply profile → defaults mapping, while respecting explicit env overrides.
    ///
    /// Rules:
    /// - dev, edge: namespaced=true, cluster_scoped=false
    /// - full: namespaced=true, cluster_scoped=true
    pub fn apply_profile_defaults(mut self) -> Self {
        let (def_ns, def_cluster) = match self.profile.as_str() {
            "full" | "prod" | "production" => (true, true),
            _ /* dev, edge */ => (true, false),
        };
        if self.features.namespaced.is_none() {
            self.features.namespaced = Some(def_ns);
        }
        if self.features.cluster_scoped.is_none() {
            self.features.cluster_scoped = Some(def_cluster);
        }
        self
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            label_selector: self.label_selector.clone(),
            resync: Duration::from_secs(self.resync_secs),
            conflict_requeue: Duration::from_secs(self.conflict_requeue_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
        }
    }

    pub fn builder_defaults(&self) -> BuilderDefaults {
        BuilderDefaults {
            image: self.image.clone(),
            cache_image: self.cache_image.clone(),
            dex_image: self.dex_image.clone(),
            proxy: ProxyEnv {
                http_proxy: self.proxy.http_proxy.clone(),
                https_proxy: self.proxy.https_proxy.clone(),
                no_proxy: self.proxy.no_proxy.clone(),
            },
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn api_refresh(&self) -> Duration {
        Duration::from_secs(self.api_refresh_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(profile: &str) -> OperatorConfig {
        OperatorConfig {
            profile: profile.to_string(),
            label_selector: String::new(),
            workers: 4,
            store_timeout_secs: 30,
            resync_secs: 300,
            conflict_requeue_secs: 5,
            error_requeue_secs: 60,
            image: "quay.io/argoproj/argocd:v2.14.2".into(),
            cache_image: "redis:7.2.7-alpine".into(),
            dex_image: "ghcr.io/dexidp/dex:v2.41.1".into(),
            api_refresh_secs: 600,
            features: FeaturesConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }

    #[test]
    fn profile_defaults_dev() {
        let cfg = base("dev").apply_profile_defaults();
        assert_eq!(cfg.features.namespaced, Some(true));
        assert_eq!(cfg.features.cluster_scoped, Some(false));
    }

    #[test]
    fn profile_defaults_full() {
        for p in ["full", "prod", "production"] {
            let cfg = base(p).apply_profile_defaults();
            assert_eq!(cfg.features.namespaced, Some(true));
            assert_eq!(cfg.features.cluster_scoped, Some(true));
        }
    }

    #[test]
    fn profile_defaults_respect_env_overrides() {
        let mut cfg = base("full");
        cfg.features.namespaced = Some(false); // explicitly disabled via env
        let cfg = cfg.apply_profile_defaults();
        assert_eq!(cfg.features.namespaced, Some(false));
        assert_eq!(cfg.features.cluster_scoped, Some(true));
    }

    #[test]
    fn durations_and_proxy_flow_through() {
        let mut cfg = base("dev");
        cfg.proxy.no_proxy = Some(".svc".into());
        let settings = cfg.engine_settings();
        assert_eq!(settings.conflict_requeue, Duration::from_secs(5));
        assert_eq!(settings.resync, Duration::from_secs(300));
        assert_eq!(cfg.builder_defaults().proxy.no_proxy.as_deref(), Some(".svc"));
        assert_eq!(cfg.store_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.builder_defaults().dex_image, "ghcr.io/dexidp/dex:v2.41.1");
    }

    #[test]
    fn api_refresh_never_spins() {
        let mut cfg = base("dev");
        assert_eq!(cfg.api_refresh(), Duration::from_secs(600));
        cfg.api_refresh_secs = 0;
        assert_eq!(cfg.api_refresh(), Duration::from_secs(1));
    }
}
