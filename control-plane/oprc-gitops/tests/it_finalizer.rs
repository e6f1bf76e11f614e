use oprc_gitops::controller::ReconcileErr;
use oprc_gitops::controller::events::REASON_CLEANUP;
use oprc_gitops::controller::finalizer::CascadeStep;
use oprc_gitops::crd::platform::LocalUserSpec;
use oprc_gitops::crd::{ClaimKind, ManagedInstance, Phase};
use oprc_gitops::store::{ResourceKind, StoreError, StoreOp};

mod common;
use common::{Harness, cluster_platform, platform, uniq};

#[test_log::test(tokio::test)]
async fn deletion_removes_everything_the_instance_owns() {
    let h = Harness::new();
    let ns = uniq("team");
    let name = uniq("argo");
    h.namespaces(&[&ns, "dev-1"]).await;
    let mut p = platform(&ns, &name);
    p.spec.common.source_namespaces = vec!["dev-1".into()];
    p.spec.common.local_users = vec![LocalUserSpec {
        name: "ci".into(),
        enabled: None,
        token_lifetime_secs: Some(3600),
        auto_renew: true,
    }];
    let key = h.create(&p).await;
    h.engine.reconcile(&key).await.unwrap();
    assert_eq!(h.engine.timers().keys_for(&key.id()).len(), 1);
    assert_eq!(h.store.count(ResourceKind::ClusterRole).await, 2);

    h.delete(&key).await;
    assert!(h.instance(&key).await.unwrap().is_deleting());
    assert_eq!(h.engine.reconcile(&key).await.unwrap(), None);

    assert!(h.instance(&key).await.is_none());
    assert_eq!(h.store.count(ResourceKind::ClusterRole).await, 0);
    assert_eq!(h.store.count(ResourceKind::ClusterRoleBinding).await, 0);
    assert_eq!(h.store.count(ResourceKind::Deployment).await, 0);
    assert_eq!(h.store.count(ResourceKind::Secret).await, 0);
    assert_eq!(h.store.count(ResourceKind::Role).await, 0);
    assert_eq!(h.claim_label("dev-1", ClaimKind::Apps).await, None);
    assert!(h.engine.timers().keys_for(&key.id()).is_empty());
    assert!(h.engine.timers().is_empty());
    assert_eq!(h.engine.registry().phase(&key.id()), None);
    assert!(
        h.events
            .reasons_for(&key.id().label_value())
            .contains(&REASON_CLEANUP)
    );

    h.store.reset_writes().await;
    assert_eq!(h.engine.reconcile(&key).await.unwrap(), None);
    assert!(h.store.write_log().await.is_empty());
}

#[test_log::test(tokio::test)]
async fn failed_step_keeps_the_finalizer() {
    let h = Harness::new();
    let ns = uniq("team");
    let name = uniq("argo");
    h.namespaces(&[&ns, "dev-1"]).await;
    let mut p = platform(&ns, &name);
    p.spec.common.source_namespaces = vec!["dev-1".into()];
    let key = h.create(&p).await;
    h.engine.reconcile(&key).await.unwrap();

    h.delete(&key).await;
    h.store
        .fail_on(
            StoreOp::Delete,
            ResourceKind::ClusterRole,
            StoreError::Backend("forbidden".into()),
        )
        .await;

    let err = h.engine.reconcile(&key).await.unwrap_err();
    match &err {
        ReconcileErr::Cascade { step, .. } => {
            assert_eq!(*step, CascadeStep::DeleteClusterResources)
        }
        other => panic!("unexpected error: {other}"),
    }
    let inst = h.instance(&key).await.unwrap();
    assert!(inst.has_finalizer());
    assert!(inst.is_deleting());
    assert_eq!(inst.status().unwrap().phase, Some(Phase::Unknown));
    // steps before the failure already ran
    assert_eq!(h.claim_label("dev-1", ClaimKind::Apps).await, None);
    assert_eq!(h.store.count(ResourceKind::ClusterRoleBinding).await, 0);
    assert_eq!(h.store.count(ResourceKind::ClusterRole).await, 2);

    h.store.clear_faults().await;
    assert_eq!(h.engine.reconcile(&key).await.unwrap(), None);
    assert!(h.instance(&key).await.is_none());
    assert_eq!(h.store.count(ResourceKind::ClusterRole).await, 0);
}

#[test_log::test(tokio::test)]
async fn instance_without_finalizer_is_left_alone() {
    let h = Harness::new();
    let ns = uniq("team");
    let key = h.create(&platform(&ns, &uniq("argo"))).await;
    h.delete(&key).await;

    assert!(h.instance(&key).await.is_none());
    h.store.reset_writes().await;
    assert_eq!(h.engine.reconcile(&key).await.unwrap(), None);
    assert!(h.store.write_log().await.is_empty());
}

#[test_log::test(tokio::test)]
async fn cluster_instance_children_are_collected() {
    let h = Harness::new();
    let target = uniq("argo-system");
    let name = uniq("shared");
    h.namespaces(&[&target, "dev-1"]).await;
    let mut p = cluster_platform(&name, &target);
    p.spec.common.source_namespaces = vec!["dev-1".into()];
    let key = h.create_cluster(&p).await;
    h.engine.reconcile(&key).await.unwrap();

    let server = h
        .child(ResourceKind::Deployment, Some(&target), &format!("{name}-server"))
        .await
        .unwrap();
    let owners = server.metadata.owner_references.unwrap_or_default();
    assert_eq!(owners[0].kind, "ClusterGitOpsPlatform");
    let role = h
        .child(
            ResourceKind::ClusterRole,
            None,
            &format!("{name}-{target}-application-controller"),
        )
        .await
        .unwrap();
    assert!(role.metadata.owner_references.is_some());

    h.delete(&key).await;
    assert_eq!(h.engine.reconcile(&key).await.unwrap(), None);
    assert!(h.instance(&key).await.is_none());
    assert_eq!(h.store.count(ResourceKind::Deployment).await, 0);
    assert_eq!(h.store.count(ResourceKind::ClusterRole).await, 0);
    assert_eq!(h.claim_label("dev-1", ClaimKind::Apps).await, None);
}
