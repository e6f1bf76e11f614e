use std::sync::Arc;

use tracing::{debug, info};

use super::ReconcileErr;
use crate::desired::{ChildResourceDescriptor, DesiredState};
use crate::diff::DiffPolicyTable;
use crate::store::{ObjectStore, delete_if_present, get_opt};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChildAction {
    Created,
    Updated(String),
    Recreated(String),
    Deleted(String),
    Noop,
}

impl ChildAction {
    pub fn is_write(&self) -> bool {
        !matches!(self, ChildAction::Noop)
    }
}

/// Converges one child object to its descriptor.
#[derive(Clone)]
pub struct ChildResourceReconciler {
    store: Arc<dyn ObjectStore>,
    policies: Arc<DiffPolicyTable>,
}

impl ChildResourceReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, policies: Arc<DiffPolicyTable>) -> Self {
        Self { store, policies }
    }

    pub async fn reconcile(
        &self,
        desc: &ChildResourceDescriptor,
    ) -> Result<ChildAction, ReconcileErr> {
        let ns = desc.namespace.as_deref();
        let live = get_opt(self.store.as_ref(), desc.kind, ns, &desc.name)
            .await
            .map_err(|e| ReconcileErr::read(desc.kind, &desc.name, e))?;

        let (desired, live) = match (&desc.state, live) {
            (DesiredState::Absent { .. }, None) => return Ok(ChildAction::Noop),
            (DesiredState::Absent { reason }, Some(_)) => {
                info!(kind = %desc.kind, name = %desc.name, "deleting: {reason}");
                delete_if_present(self.store.as_ref(), desc.kind, ns, &desc.name)
                    .await
                    .map_err(|e| ReconcileErr::write(desc.kind, &desc.name, e))?;
                return Ok(ChildAction::Deleted(reason.clone()));
            }
            (DesiredState::Present(desired), None) => {
                info!(kind = %desc.kind, name = %desc.name, "creating");
                self.store
                    .create(desc.kind, desired)
                    .await
                    .map_err(|e| ReconcileErr::write(desc.kind, &desc.name, e))?;
                return Ok(ChildAction::Created);
            }
            (DesiredState::Present(desired), Some(live)) => (desired, live),
        };

        if live.metadata.deletion_timestamp.is_some() {
            debug!(kind = %desc.kind, name = %desc.name, "waiting for deletion to finish");
            return Ok(ChildAction::Noop);
        }

        let policy = self.policies.get(desc.policy).ok_or_else(|| {
            ReconcileErr::Internal(format!("no diff policy for {}", desc.policy))
        })?;
        let outcome = policy
            .diff(&live, desired)
            .map_err(|e| ReconcileErr::Internal(e.to_string()))?;
        if !outcome.is_changed() {
            return Ok(ChildAction::Noop);
        }

        let why = outcome.explanation();
        if outcome.recreate {
            info!(kind = %desc.kind, name = %desc.name, "recreating: {why}");
            delete_if_present(self.store.as_ref(), desc.kind, ns, &desc.name)
                .await
                .map_err(|e| ReconcileErr::write(desc.kind, &desc.name, e))?;
            self.store
                .create(desc.kind, desired)
                .await
                .map_err(|e| ReconcileErr::write(desc.kind, &desc.name, e))?;
            return Ok(ChildAction::Recreated(why));
        }

        info!(kind = %desc.kind, name = %desc.name, "updating: {why}");
        self.store
            .update(desc.kind, &outcome.patched)
            .await
            .map_err(|e| ReconcileErr::write(desc.kind, &desc.name, e))?;
        Ok(ChildAction::Updated(why))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ResourceKind, StoreError, StoreOp};
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use std::collections::BTreeMap;

    fn deployment(image: &str, replicas: i32) -> Deployment {
        let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("ns".into()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".into(),
                            image: Some(image.into()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn present(d: &Deployment) -> ChildResourceDescriptor {
        ChildResourceDescriptor::present(ResourceKind::Deployment, "web", d).unwrap()
    }

    fn reconciler(store: &MemoryStore) -> ChildResourceReconciler {
        ChildResourceReconciler::new(
            Arc::new(store.clone()),
            Arc::new(DiffPolicyTable::standard()),
        )
    }

    #[tokio::test]
    async fn create_then_noop_then_update() {
        let store = MemoryStore::new();
        let rec = reconciler(&store);

        let action = rec.reconcile(&present(&deployment("a:1", 1))).await.unwrap();
        assert_eq!(action, ChildAction::Created);
        let action = rec.reconcile(&present(&deployment("a:1", 1))).await.unwrap();
        assert_eq!(action, ChildAction::Noop);
        assert_eq!(store.writes().await, 1);

        let action = rec.reconcile(&present(&deployment("a:2", 2))).await.unwrap();
        assert_eq!(action, ChildAction::Updated("replicas, container image".into()));
    }

    #[tokio::test]
    async fn absent_deletes_live_object_once() {
        let store = MemoryStore::new();
        let rec = reconciler(&store);
        rec.reconcile(&present(&deployment("a:1", 1))).await.unwrap();

        let gone = ChildResourceDescriptor::absent(
            ResourceKind::Deployment,
            Some("ns"),
            "web",
            "web",
            "feature is disabled",
        );
        assert_eq!(
            rec.reconcile(&gone).await.unwrap(),
            ChildAction::Deleted("feature is disabled".into())
        );
        assert_eq!(rec.reconcile(&gone).await.unwrap(), ChildAction::Noop);
        assert!(!store.contains(ResourceKind::Deployment, Some("ns"), "web").await);
    }

    #[tokio::test]
    async fn immutable_selector_change_recreates() {
        let store = MemoryStore::new();
        let rec = reconciler(&store);
        rec.reconcile(&present(&deployment("a:1", 1))).await.unwrap();

        let mut changed = deployment("a:1", 1);
        if let Some(spec) = changed.spec.as_mut() {
            spec.selector.match_labels = Some(BTreeMap::from([("app".into(), "web2".into())]));
        }
        let action = rec.reconcile(&present(&changed)).await.unwrap();
        assert!(matches!(action, ChildAction::Recreated(_)));
        let ops: Vec<_> = store.write_log().await.into_iter().map(|(op, _, _)| op).collect();
        assert_eq!(ops, vec![StoreOp::Create, StoreOp::Delete, StoreOp::Create]);
    }

    #[tokio::test]
    async fn write_conflicts_are_classified() {
        let store = MemoryStore::new();
        let rec = reconciler(&store);
        rec.reconcile(&present(&deployment("a:1", 1))).await.unwrap();
        store
            .fail_on(
                StoreOp::Update,
                ResourceKind::Deployment,
                StoreError::Conflict {
                    kind: ResourceKind::Deployment,
                    name: "web".into(),
                    message: "stale".into(),
                },
            )
            .await;
        let err = rec.reconcile(&present(&deployment("a:2", 1))).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
