//! Runtime detection of optional cluster APIs.
//!
//! Which exposure object the server gets depends on what the cluster
//! serves: an OpenShift Route when `route.openshift.io` is present, a
//! standard Ingress otherwise. Answers are cached per resource until
//! [`ApiDetector::invalidate`] is called.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::Client;
use tracing::{debug, info, warn};

use crate::store::{StoreError, StoreResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    pub group: &'static str,
    pub version: &'static str,
    pub resource: &'static str,
}

impl GroupVersionResource {
    pub const fn new(
        group: &'static str,
        version: &'static str,
        resource: &'static str,
    ) -> Self {
        Self {
            group,
            version,
            resource,
        }
    }

    /// `group/version`, or just `version` for the core group.
    pub fn group_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_version(), self.resource)
    }
}

pub const ROUTE: GroupVersionResource =
    GroupVersionResource::new("route.openshift.io", "v1", "routes");
pub const INGRESS: GroupVersionResource =
    GroupVersionResource::new("networking.k8s.io", "v1", "ingresses");

/// How the server is exposed outside the cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Exposure {
    Route,
    #[default]
    Ingress,
}

/// Lists the resources served under one group/version.
#[async_trait]
pub trait ApiDiscovery: Send + Sync {
    /// `None` when the group/version is not served at all.
    async fn resources(&self, group_version: &str) -> StoreResult<Option<Vec<String>>>;
}

/// Discovery against the API server.
#[derive(Clone)]
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ApiDiscovery for KubeDiscovery {
    async fn resources(&self, group_version: &str) -> StoreResult<Option<Vec<String>>> {
        let list = if group_version.contains('/') {
            self.client.list_api_group_resources(group_version).await
        } else {
            self.client.list_core_api_resources(group_version).await
        };
        match list {
            Ok(list) => Ok(Some(list.resources.into_iter().map(|r| r.name).collect())),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }
}

/// Fixed set of served resources.
#[derive(Clone, Debug, Default)]
pub struct StaticDiscovery {
    served: BTreeSet<String>,
}

impl StaticDiscovery {
    pub fn new(served: &[GroupVersionResource]) -> Self {
        Self {
            served: served.iter().map(ToString::to_string).collect(),
        }
    }

    /// A plain Kubernetes cluster: Ingress but no Route.
    pub fn kubernetes() -> Self {
        Self::new(&[INGRESS])
    }

    pub fn openshift() -> Self {
        Self::new(&[INGRESS, ROUTE])
    }
}

#[async_trait]
impl ApiDiscovery for StaticDiscovery {
    async fn resources(&self, group_version: &str) -> StoreResult<Option<Vec<String>>> {
        let prefix = format!("{group_version}/");
        let found: Vec<String> = self
            .served
            .iter()
            .filter_map(|s| s.strip_prefix(&prefix))
            .map(str::to_string)
            .collect();
        Ok((!found.is_empty()).then_some(found))
    }
}

pub struct ApiDetector {
    discovery: Box<dyn ApiDiscovery>,
    cache: Mutex<HashMap<GroupVersionResource, bool>>,
}

impl ApiDetector {
    pub fn new(discovery: impl ApiDiscovery + 'static) -> Self {
        Self {
            discovery: Box::new(discovery),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<GroupVersionResource, bool>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the cluster serves `gvr`. A failed lookup reports the API
    /// as missing and is retried on the next call.
    pub async fn has_api(&self, gvr: GroupVersionResource) -> bool {
        let cached = self.cache().get(&gvr).copied();
        if let Some(found) = cached {
            return found;
        }
        let found = match self.discovery.resources(&gvr.group_version()).await {
            Ok(Some(resources)) => resources.iter().any(|r| r == gvr.resource),
            Ok(None) => false,
            Err(e) => {
                warn!(%gvr, error = %e, "api discovery failed");
                return false;
            }
        };
        debug!(%gvr, found, "api discovered");
        self.cache().insert(gvr, found);
        found
    }

    pub async fn has_route(&self) -> bool {
        self.has_api(ROUTE).await
    }

    /// Route when served, Ingress otherwise.
    pub async fn preferred_exposure(&self) -> Exposure {
        if self.has_route().await {
            Exposure::Route
        } else {
            Exposure::Ingress
        }
    }

    /// Forget every cached answer.
    pub fn invalidate(&self) {
        self.cache().clear();
        info!("api cache invalidated");
    }
}

impl Default for ApiDetector {
    fn default() -> Self {
        Self::new(StaticDiscovery::kubernetes())
    }
}
