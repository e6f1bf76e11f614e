//! Label and annotation conventions shared by every part of the operator.
//!
//! Keys under [`DOMAIN`] are owned by this operator. Keys containing one of
//! [`RESERVED_KEY_FRAGMENTS`] belong to the platform (scheduler, cloud
//! providers, OpenShift) and must survive diffing untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const DOMAIN: &str = "gitops.oaas.io";
pub const FINALIZER: &str = "gitops.oaas.io/finalizer";

/// Identity of the owning instance, stamped on every child object.
pub const LABEL_INSTANCE: &str = "gitops.oaas.io/instance";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const PART_OF: &str = "oaas-gitops";
pub const MANAGED_BY: &str = "oprc-gitops";

pub const ANNOTATION_CACHE_TLS_CHECKSUM: &str =
    "gitops.oaas.io/cache-tls-checksum";
pub const ANNOTATION_TOKEN_EXPIRES_AT: &str = "gitops.oaas.io/token-expires-at";
pub const ANNOTATION_LOCAL_USER: &str = "gitops.oaas.io/local-user";

pub const ANNOTATION_PROMETHEUS_SCRAPE: &str = "prometheus.io/scrape";
pub const ANNOTATION_PROMETHEUS_PORT: &str = "prometheus.io/port";
pub const ANNOTATION_PROMETHEUS_PATH: &str = "prometheus.io/path";
pub const LABEL_MONITORING: &str = "monitoring";

pub const RESERVED_KEY_FRAGMENTS: &[&str] =
    &["kubernetes.io", "k8s.io", "openshift.io"];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEY_FRAGMENTS.iter().any(|f| key.contains(f))
}

/// Copy reserved keys present on the live object into the desired map.
/// Values the operator sets explicitly win over live values.
pub fn preserve_reserved(
    desired: &mut Option<BTreeMap<String, String>>,
    live: Option<&BTreeMap<String, String>>,
) {
    let Some(live) = live else {
        return;
    };
    for (k, v) in live.iter().filter(|(k, _)| is_reserved_key(k)) {
        desired
            .get_or_insert_with(BTreeMap::new)
            .entry(k.clone())
            .or_insert_with(|| v.clone());
    }
}

/// Standard labels for a child object of `instance_label`.
pub fn child_labels(
    instance_label: &str,
    name: &str,
    component: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_INSTANCE.to_string(), instance_label.to_string()),
        (LABEL_NAME.to_string(), name.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_PART_OF.to_string(), PART_OF.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty key in selector term '{0}'")]
    EmptyKey(String),
    #[error("invalid character in selector term '{0}'")]
    InvalidTerm(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|l| l.get(k));
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v),
            Requirement::NotEquals(k, v) => get(k) != Some(v),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::NotExists(k) => get(k).is_none(),
        }
    }
}

/// Equality-based label selector (`a=b,c!=d,e,!f`), the subset of the
/// Kubernetes selector grammar the operator relies on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(Vec<Requirement>);

impl Selector {
    pub fn everything() -> Self {
        Self(Vec::new())
    }

    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self(vec![Requirement::Equals(key.into(), value.into())])
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self(vec![Requirement::Exists(key.into())])
    }

    pub fn is_everything(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|r| r.matches(labels))
    }
}

fn valid_token(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut reqs = Vec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let req = if let Some(key) = term.strip_prefix('!') {
                Requirement::NotExists(key.trim().to_string())
            } else if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
            {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };
            let (key, value) = match &req {
                Requirement::Equals(k, v) | Requirement::NotEquals(k, v) => {
                    (k.as_str(), v.as_str())
                }
                Requirement::Exists(k) | Requirement::NotExists(k) => {
                    (k.as_str(), "")
                }
            };
            if key.is_empty() {
                return Err(SelectorError::EmptyKey(term.to_string()));
            }
            if !valid_token(key) || !valid_token(value) {
                return Err(SelectorError::InvalidTerm(term.to_string()));
            }
            reqs.push(req);
        }
        Ok(Self(reqs))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .0
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{k}={v}"),
                Requirement::NotEquals(k, v) => format!("{k}!={v}"),
                Requirement::Exists(k) => k.clone(),
                Requirement::NotExists(k) => format!("!{k}"),
            })
            .collect();
        write!(f, "{}", terms.join(","))
    }
}
