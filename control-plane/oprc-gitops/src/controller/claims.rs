//! Source-namespace claims.
//!
//! An instance claims a namespace for a [`ClaimKind`] by labelling it with
//! its identity and installing a Role and RoleBinding there for the
//! component that consumes it. Claims obey two rules:
//!
//! * at most one instance holds any (namespace, kind) pair, and whoever
//!   holds `apps` on a namespace locks every other instance out of it;
//! * `appsets` and `notifications` are only held where the same instance
//!   also holds `apps`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::ReconcileErr;
use super::children::ChildResourceReconciler;
use super::ownership::OwnershipRegistrar;
use crate::crd::{ClaimKind, InstanceId, ManagedInstance};
use crate::desired::ChildResourceDescriptor;
use crate::labels::{Selector, child_labels};
use crate::store::{ObjectStore, ResourceKind, delete_if_present, get_opt};

const COMPONENT: &str = "source-namespace";

/// A source-namespace entry: a literal name or a `*` glob.
#[derive(Clone, Debug)]
pub struct NamespacePattern {
    raw: String,
    glob: Option<Regex>,
}

impl NamespacePattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '*');
        if !valid {
            return Err(format!("invalid source namespace pattern '{raw}'"));
        }
        let glob = if raw.contains('*') {
            let expr = format!("^{}$", regex::escape(raw).replace(r"\*", ".*"));
            Some(Regex::new(&expr).map_err(|e| format!("pattern '{raw}': {e}"))?)
        } else {
            None
        };
        Ok(Self {
            raw: raw.to_string(),
            glob,
        })
    }

    pub fn is_glob(&self) -> bool {
        self.glob.is_some()
    }

    pub fn matches(&self, namespace: &str) -> bool {
        match &self.glob {
            Some(re) => re.is_match(namespace),
            None => self.raw == namespace,
        }
    }
}

/// Parse every pattern of every claim kind, failing on the first bad one.
pub fn validate_patterns(instance: &dyn ManagedInstance) -> Result<(), ReconcileErr> {
    for kind in ClaimKind::ALL {
        for raw in instance.source_namespaces(kind) {
            NamespacePattern::parse(&raw).map_err(ReconcileErr::Validation)?;
        }
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Held by another instance.
    Contended(InstanceId),
    /// The instance does not hold `apps` there.
    NotSubset,
    Missing,
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(s(groups)),
        resources: Some(s(resources)),
        verbs: s(verbs),
        ..Default::default()
    }
}

const ALL_VERBS: &[&str] = &["create", "get", "list", "watch", "update", "delete", "patch"];

fn rules_for(kind: ClaimKind) -> Vec<PolicyRule> {
    match kind {
        ClaimKind::Apps => vec![
            rule(&["argoproj.io"], &["applications"], ALL_VERBS),
            rule(&[""], &["events"], &["create", "list"]),
        ],
        ClaimKind::AppSets => vec![
            rule(&["argoproj.io"], &["applicationsets", "applications"], ALL_VERBS),
            rule(&[""], &["secrets", "configmaps"], &["get", "list", "watch"]),
            rule(&[""], &["events"], &["create", "patch"]),
        ],
        ClaimKind::Notifications => vec![
            rule(&["argoproj.io"], &["applications", "appprojects"], &[
                "get", "list", "watch", "update", "patch",
            ]),
            rule(&[""], &["configmaps", "secrets"], &["get", "list", "watch"]),
            rule(&[""], &["events"], &["create", "patch"]),
        ],
    }
}

fn consumers(kind: ClaimKind) -> &'static [&'static str] {
    match kind {
        ClaimKind::Apps => &["server", "application-controller"],
        ClaimKind::AppSets => &["applicationset-controller"],
        ClaimKind::Notifications => &["notifications-controller"],
    }
}

fn label_of<'a>(ns: &'a DynamicObject, kind: ClaimKind) -> Option<&'a str> {
    ns.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(kind.label_key()))
        .map(String::as_str)
}

type ClaimIndex = BTreeMap<(String, ClaimKind), InstanceId>;

pub struct SourceNamespaceManager {
    store: Arc<dyn ObjectStore>,
    children: ChildResourceReconciler,
    index: Mutex<ClaimIndex>,
}

impl SourceNamespaceManager {
    pub fn new(store: Arc<dyn ObjectStore>, children: ChildResourceReconciler) -> Self {
        Self {
            store,
            children,
            index: Mutex::new(BTreeMap::new()),
        }
    }

    /// Rebuild the in-memory claim index from namespace labels.
    pub async fn rebuild_index(&self) -> Result<usize, ReconcileErr> {
        let mut index = BTreeMap::new();
        for kind in ClaimKind::ALL {
            let labelled = self
                .store
                .list(ResourceKind::Namespace, None, &Selector::exists(kind.label_key()))
                .await
                .map_err(|e| ReconcileErr::read(ResourceKind::Namespace, "*", e))?;
            for ns in labelled {
                if let (Some(name), Some(owner)) = (ns.metadata.name.clone(), label_of(&ns, kind)) {
                    index.insert((name, kind), InstanceId::from_label(owner));
                }
            }
        }
        let n = index.len();
        *self.index.lock().await = index;
        info!(claims = n, "claim index rebuilt");
        Ok(n)
    }

    pub async fn holder(&self, namespace: &str, kind: ClaimKind) -> Option<InstanceId> {
        self.index
            .lock()
            .await
            .get(&(namespace.to_string(), kind))
            .cloned()
    }

    pub async fn claims_of(&self, id: &InstanceId) -> Vec<(String, ClaimKind)> {
        self.index
            .lock()
            .await
            .iter()
            .filter(|(_, holder)| *holder == id)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Namespaces currently labelled as claimed by `id` for `kind`.
    async fn held(&self, id: &InstanceId, kind: ClaimKind) -> Result<BTreeSet<String>, ReconcileErr> {
        let mut held: BTreeSet<String> = self
            .store
            .list(
                ResourceKind::Namespace,
                None,
                &Selector::eq(kind.label_key(), id.label_value()),
            )
            .await
            .map_err(|e| ReconcileErr::read(ResourceKind::Namespace, "*", e))?
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect();
        held.extend(
            self.index
                .lock()
                .await
                .iter()
                .filter(|((_, k), holder)| *k == kind && *holder == id)
                .map(|((ns, _), _)| ns.clone()),
        );
        Ok(held)
    }

    /// Expand the instance's patterns for `kind` into namespace names.
    async fn resolve(
        &self,
        instance: &dyn ManagedInstance,
        kind: ClaimKind,
        all: &mut Option<Vec<String>>,
    ) -> Result<BTreeSet<String>, ReconcileErr> {
        let own = instance.target_namespace();
        let mut out = BTreeSet::new();
        for raw in instance.source_namespaces(kind) {
            let pattern = NamespacePattern::parse(&raw).map_err(ReconcileErr::Validation)?;
            if !pattern.is_glob() {
                out.insert(raw);
                continue;
            }
            if all.is_none() {
                let names = self
                    .store
                    .list(ResourceKind::Namespace, None, &Selector::everything())
                    .await
                    .map_err(|e| ReconcileErr::read(ResourceKind::Namespace, "*", e))?
                    .into_iter()
                    .filter_map(|ns| ns.metadata.name)
                    .collect();
                *all = Some(names);
            }
            if let Some(names) = all.as_ref() {
                out.extend(names.iter().filter(|n| pattern.matches(n)).cloned());
            }
        }
        out.remove(&own);
        Ok(out)
    }

    /// Converge the instance's claims to its current spec.
    pub async fn reconcile(&self, instance: &dyn ManagedInstance) -> Result<(), ReconcileErr> {
        let id = instance.id();
        let mut all = None;
        let mut desired = BTreeMap::new();
        for kind in ClaimKind::ALL {
            desired.insert(kind, self.resolve(instance, kind, &mut all).await?);
        }
        let apps = desired.get(&ClaimKind::Apps).cloned().unwrap_or_default();

        let mut errors = Vec::new();
        for kind in [ClaimKind::Notifications, ClaimKind::AppSets, ClaimKind::Apps] {
            let wanted = desired.get(&kind).cloned().unwrap_or_default();
            for ns in self.held(&id, kind).await? {
                let keep = wanted.contains(&ns) && (kind == ClaimKind::Apps || apps.contains(&ns));
                if keep {
                    continue;
                }
                if let Err(e) = self.release(instance, &ns, kind).await {
                    errors.push(e);
                }
            }
        }

        for kind in ClaimKind::ALL {
            for ns in desired.get(&kind).cloned().unwrap_or_default() {
                match self.claim(instance, &ns, kind).await {
                    Ok(ClaimOutcome::Contended(holder)) => {
                        debug!(namespace = %ns, %kind, %holder, "namespace claimed by another instance")
                    }
                    Ok(ClaimOutcome::NotSubset) => {
                        debug!(namespace = %ns, %kind, "skipping: apps not held on namespace")
                    }
                    Ok(_) => {}
                    Err(e) => errors.push(e),
                }
            }
        }
        ReconcileErr::collect(errors)
    }

    /// Claim one (namespace, kind) pair for `instance`.
    pub async fn claim(
        &self,
        instance: &dyn ManagedInstance,
        namespace: &str,
        kind: ClaimKind,
    ) -> Result<ClaimOutcome, ReconcileErr> {
        let id = instance.id();
        let label = id.label_value();
        let Some(mut ns) = get_opt(self.store.as_ref(), ResourceKind::Namespace, None, namespace)
            .await
            .map_err(|e| ReconcileErr::read(ResourceKind::Namespace, namespace, e))?
        else {
            self.forget(namespace, kind, &id).await;
            return Ok(ClaimOutcome::Missing);
        };
        if ns.metadata.deletion_timestamp.is_some() {
            return Ok(ClaimOutcome::Missing);
        }

        if let Some(owner) = label_of(&ns, ClaimKind::Apps).filter(|o| *o != label) {
            let owner = InstanceId::from_label(owner);
            if label_of(&ns, kind) == Some(label.as_str()) {
                self.release(instance, namespace, kind).await?;
            }
            return Ok(ClaimOutcome::Contended(owner));
        }
        if kind != ClaimKind::Apps && label_of(&ns, ClaimKind::Apps) != Some(label.as_str()) {
            return Ok(ClaimOutcome::NotSubset);
        }
        if let Some(owner) = label_of(&ns, kind).filter(|o| *o != label) {
            return Ok(ClaimOutcome::Contended(InstanceId::from_label(owner)));
        }

        if label_of(&ns, kind).is_none() {
            info!(namespace, %kind, instance = %id, "claiming namespace");
            ns.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert(kind.label_key().to_string(), label.clone());
            self.store
                .update(ResourceKind::Namespace, &ns)
                .await
                .map_err(|e| ReconcileErr::write(ResourceKind::Namespace, namespace, e))?;
        }

        for desc in self.rbac(instance, namespace, kind)? {
            self.children.reconcile(&desc).await?;
        }
        self.index
            .lock()
            .await
            .insert((namespace.to_string(), kind), id);
        Ok(ClaimOutcome::Claimed)
    }

    /// Drop one claim: RBAC first, then the namespace label.
    pub async fn release(
        &self,
        instance: &dyn ManagedInstance,
        namespace: &str,
        kind: ClaimKind,
    ) -> Result<(), ReconcileErr> {
        let id = instance.id();
        let name = OwnershipRegistrar::claim_rbac_name(instance, kind);
        for rk in [ResourceKind::RoleBinding, ResourceKind::Role] {
            delete_if_present(self.store.as_ref(), rk, Some(namespace), &name)
                .await
                .map_err(|e| ReconcileErr::write(rk, &name, e))?;
        }

        let ns = get_opt(self.store.as_ref(), ResourceKind::Namespace, None, namespace)
            .await
            .map_err(|e| ReconcileErr::read(ResourceKind::Namespace, namespace, e))?;
        if let Some(mut ns) = ns.filter(|ns| label_of(ns, kind) == Some(id.label_value().as_str())) {
            info!(namespace, %kind, instance = %id, "releasing namespace");
            if let Some(labels) = ns.metadata.labels.as_mut() {
                labels.remove(kind.label_key());
            }
            self.store
                .update(ResourceKind::Namespace, &ns)
                .await
                .map_err(|e| ReconcileErr::write(ResourceKind::Namespace, namespace, e))?;
        }
        self.forget(namespace, kind, &id).await;
        Ok(())
    }

    /// Release every claim of the instance, dependent kinds first.
    /// Stops at the first failure.
    pub async fn release_all(&self, instance: &dyn ManagedInstance) -> Result<usize, ReconcileErr> {
        let id = instance.id();
        let mut released = 0;
        for kind in [ClaimKind::Notifications, ClaimKind::AppSets, ClaimKind::Apps] {
            for ns in self.held(&id, kind).await? {
                self.release(instance, &ns, kind).await?;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn forget(&self, namespace: &str, kind: ClaimKind, id: &InstanceId) {
        let mut index = self.index.lock().await;
        let key = (namespace.to_string(), kind);
        if index.get(&key) == Some(id) {
            index.remove(&key);
        }
    }

    fn rbac(
        &self,
        instance: &dyn ManagedInstance,
        namespace: &str,
        kind: ClaimKind,
    ) -> Result<Vec<ChildResourceDescriptor>, ReconcileErr> {
        let name = OwnershipRegistrar::claim_rbac_name(instance, kind);
        let target = instance.target_namespace();
        let meta = ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(child_labels(&instance.id().label_value(), &name, COMPONENT)),
            ..Default::default()
        };
        let role = Role {
            metadata: meta.clone(),
            rules: Some(rules_for(kind)),
        };
        let binding = RoleBinding {
            metadata: meta,
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "Role".into(),
                name: name.clone(),
            },
            subjects: Some(
                consumers(kind)
                    .iter()
                    .map(|c| Subject {
                        kind: "ServiceAccount".into(),
                        name: format!("{}-{c}", instance.name()),
                        namespace: Some(target.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
        };
        let internal = |e: crate::store::StoreError| ReconcileErr::Internal(e.to_string());
        Ok(vec![
            ChildResourceDescriptor::present(ResourceKind::Role, COMPONENT, &role).map_err(internal)?,
            ChildResourceDescriptor::present(ResourceKind::RoleBinding, COMPONENT, &binding)
                .map_err(internal)?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_glob_patterns() {
        let lit = NamespacePattern::parse("team-a").unwrap();
        assert!(lit.matches("team-a"));
        assert!(!lit.matches("team-ab"));

        let glob = NamespacePattern::parse("team-*").unwrap();
        assert!(glob.is_glob());
        assert!(glob.matches("team-a"));
        assert!(glob.matches("team-"));
        assert!(!glob.matches("xteam-a"));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(NamespacePattern::parse("").is_err());
        assert!(NamespacePattern::parse("Team").is_err());
        assert!(NamespacePattern::parse("a.b").is_err());
        assert!(NamespacePattern::parse("[a-z]").is_err());
    }

    #[test]
    fn subjects_follow_claim_kind() {
        assert_eq!(consumers(ClaimKind::Apps), &["server", "application-controller"]);
        assert_eq!(consumers(ClaimKind::AppSets), &["applicationset-controller"]);
    }
}
