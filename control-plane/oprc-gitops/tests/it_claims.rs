use k8s_openapi::api::rbac::v1::RoleBinding;
use oprc_gitops::crd::platform::{ApplicationSetSpec, NotificationsSpec};
use oprc_gitops::crd::{ClaimKind, InstanceKey, Phase};
use oprc_gitops::store::{ResourceKind, from_dynamic};

mod common;
use common::{Harness, cluster_platform, platform, uniq};

fn rbac_name(key: &InstanceKey, target_ns: &str, kind: ClaimKind) -> String {
    format!("{}.{}.{}", key.name, target_ns, kind.suffix())
}

async fn has_role(h: &Harness, ns: &str, name: &str) -> bool {
    h.child(ResourceKind::Role, Some(ns), name).await.is_some()
        && h.child(ResourceKind::RoleBinding, Some(ns), name).await.is_some()
}

#[test_log::test(tokio::test)]
async fn first_claimant_holds_namespace_exclusively() {
    let h = Harness::new();
    let (ns_a, ns_b) = (uniq("team-a"), uniq("team-b"));
    h.namespaces(&[&ns_a, &ns_b, "shared"]).await;

    let mut a = platform(&ns_a, "argo");
    a.spec.common.source_namespaces = vec!["shared".into()];
    let mut b = platform(&ns_b, "argo");
    b.spec.common.source_namespaces = vec!["shared".into()];
    let key_a = h.create(&a).await;
    let key_b = h.create(&b).await;

    h.engine.reconcile(&key_a).await.unwrap();
    h.engine.reconcile(&key_b).await.unwrap();

    assert_eq!(
        h.claim_label("shared", ClaimKind::Apps).await,
        Some(key_a.id().label_value())
    );
    assert!(has_role(&h, "shared", &rbac_name(&key_a, &ns_a, ClaimKind::Apps)).await);
    assert!(!has_role(&h, "shared", &rbac_name(&key_b, &ns_b, ClaimKind::Apps)).await);
    // losing a claim is not an error
    assert_eq!(h.status(&key_b).await.unwrap().phase, Some(Phase::Available));
    assert_eq!(
        h.engine.claims().holder("shared", ClaimKind::Apps).await,
        Some(key_a.id())
    );

    // once the holder goes away the other instance picks it up
    h.delete(&key_a).await;
    h.engine.reconcile(&key_a).await.unwrap();
    assert!(h.instance(&key_a).await.is_none());
    assert_eq!(h.claim_label("shared", ClaimKind::Apps).await, None);

    h.engine.reconcile(&key_b).await.unwrap();
    assert_eq!(
        h.claim_label("shared", ClaimKind::Apps).await,
        Some(key_b.id().label_value())
    );
    assert!(has_role(&h, "shared", &rbac_name(&key_b, &ns_b, ClaimKind::Apps)).await);
}

#[test_log::test(tokio::test)]
async fn dependent_claims_stay_within_apps() {
    let h = Harness::new();
    let ns = uniq("team");
    h.namespaces(&[&ns, "dev-1", "dev-2"]).await;
    let mut p = platform(&ns, "argo");
    p.spec.common.source_namespaces = vec!["dev-1".into()];
    p.spec.common.application_set = Some(ApplicationSetSpec {
        source_namespaces: vec!["dev-1".into(), "dev-2".into()],
        ..Default::default()
    });
    let key = h.create(&p).await;
    let label = key.id().label_value();

    h.engine.reconcile(&key).await.unwrap();
    assert_eq!(h.claim_label("dev-1", ClaimKind::AppSets).await, Some(label.clone()));
    assert_eq!(h.claim_label("dev-2", ClaimKind::AppSets).await, None);
    assert_eq!(h.claim_label("dev-2", ClaimKind::Apps).await, None);
    assert!(has_role(&h, "dev-1", &rbac_name(&key, &ns, ClaimKind::AppSets)).await);
    assert!(!has_role(&h, "dev-2", &rbac_name(&key, &ns, ClaimKind::AppSets)).await);

    let binding = h
        .child(
            ResourceKind::RoleBinding,
            Some("dev-1"),
            &rbac_name(&key, &ns, ClaimKind::AppSets),
        )
        .await
        .unwrap();
    let binding: RoleBinding = from_dynamic(ResourceKind::RoleBinding, &binding).unwrap();
    let subjects: Vec<_> = binding
        .subjects
        .unwrap_or_default()
        .into_iter()
        .map(|s| (s.name, s.namespace))
        .collect();
    assert_eq!(
        subjects,
        vec![("argo-applicationset-controller".to_string(), Some(ns.clone()))]
    );

    // dropping apps drags the dependent claim with it
    h.edit(&key, |s| s.source_namespaces.clear()).await;
    h.engine.reconcile(&key).await.unwrap();
    let labels = h.ns_labels("dev-1").await;
    assert!(!labels.contains_key(ClaimKind::Apps.label_key()));
    assert!(!labels.contains_key(ClaimKind::AppSets.label_key()));
    assert!(!has_role(&h, "dev-1", &rbac_name(&key, &ns, ClaimKind::AppSets)).await);
    assert!(!has_role(&h, "dev-1", &rbac_name(&key, &ns, ClaimKind::Apps)).await);
}

#[test_log::test(tokio::test)]
async fn glob_claims_follow_new_namespaces() {
    let h = Harness::new();
    h.namespaces(&["dev-home", "dev-1"]).await;
    let mut p = platform("dev-home", "argo");
    p.spec.common.source_namespaces = vec!["dev-*".into()];
    let key = h.create(&p).await;
    let label = key.id().label_value();

    h.engine.reconcile(&key).await.unwrap();
    assert_eq!(h.claim_label("dev-1", ClaimKind::Apps).await, Some(label.clone()));
    // the instance's own namespace is never claimed
    assert_eq!(h.claim_label("dev-home", ClaimKind::Apps).await, None);

    h.namespaces(&["dev-2", "prod-1"]).await;
    h.engine.reconcile(&key).await.unwrap();
    assert_eq!(h.claim_label("dev-2", ClaimKind::Apps).await, Some(label));
    assert_eq!(h.claim_label("prod-1", ClaimKind::Apps).await, None);
    assert_eq!(h.engine.claims().claims_of(&key.id()).await.len(), 2);
}

#[test_log::test(tokio::test)]
async fn glob_skips_namespaces_held_elsewhere() {
    let h = Harness::new();
    let (ns_a, ns_b) = (uniq("team-a"), uniq("team-b"));
    h.namespaces(&[&ns_a, &ns_b, "dev-1", "dev-2"]).await;

    let mut holder = platform(&ns_b, "argo");
    holder.spec.common.source_namespaces = vec!["dev-1".into()];
    let holder = h.create(&holder).await;
    h.engine.reconcile(&holder).await.unwrap();

    let mut globber = platform(&ns_a, "argo");
    globber.spec.common.source_namespaces = vec!["dev-*".into()];
    globber.spec.common.notifications = Some(NotificationsSpec {
        enabled: true,
        source_namespaces: vec!["dev-*".into()],
        ..Default::default()
    });
    let globber = h.create(&globber).await;
    h.engine.reconcile(&globber).await.unwrap();

    let dev1 = h.ns_labels("dev-1").await;
    assert_eq!(
        dev1.get(ClaimKind::Apps.label_key()),
        Some(&holder.id().label_value())
    );
    assert!(!dev1.contains_key(ClaimKind::Notifications.label_key()));
    let dev2 = h.ns_labels("dev-2").await;
    assert_eq!(
        dev2.get(ClaimKind::Apps.label_key()),
        Some(&globber.id().label_value())
    );
    assert_eq!(
        dev2.get(ClaimKind::Notifications.label_key()),
        Some(&globber.id().label_value())
    );
}

#[test_log::test(tokio::test)]
async fn disabling_notifications_releases_its_claims() {
    let h = Harness::new();
    let ns = uniq("team");
    h.namespaces(&[&ns, "dev-1"]).await;
    let mut p = platform(&ns, "argo");
    p.spec.common.source_namespaces = vec!["dev-1".into()];
    p.spec.common.notifications = Some(NotificationsSpec {
        enabled: true,
        source_namespaces: vec!["dev-1".into()],
        ..Default::default()
    });
    let key = h.create(&p).await;
    h.engine.reconcile(&key).await.unwrap();
    assert!(has_role(&h, "dev-1", &rbac_name(&key, &ns, ClaimKind::Notifications)).await);

    h.edit(&key, |s| {
        if let Some(n) = s.notifications.as_mut() {
            n.enabled = false;
        }
    })
    .await;
    h.engine.reconcile(&key).await.unwrap();
    assert_eq!(h.claim_label("dev-1", ClaimKind::Notifications).await, None);
    assert!(!has_role(&h, "dev-1", &rbac_name(&key, &ns, ClaimKind::Notifications)).await);
    assert_eq!(
        h.claim_label("dev-1", ClaimKind::Apps).await,
        Some(key.id().label_value())
    );
}

#[test_log::test(tokio::test)]
async fn cluster_instance_competes_for_namespaces() {
    let h = Harness::new();
    let ns = uniq("team");
    h.namespaces(&[&ns, "argo-system", "shared"]).await;

    let mut shared = cluster_platform("shared-argo", "argo-system");
    shared.spec.common.source_namespaces = vec!["shared".into()];
    let cluster = h.create_cluster(&shared).await;
    h.engine.reconcile(&cluster).await.unwrap();
    assert_eq!(
        h.claim_label("shared", ClaimKind::Apps).await,
        Some("shared-argo".to_string())
    );
    assert!(has_role(&h, "shared", "shared-argo.argo-system.apps").await);

    let mut p = platform(&ns, "argo");
    p.spec.common.source_namespaces = vec!["shared".into()];
    let key = h.create(&p).await;
    h.engine.reconcile(&key).await.unwrap();
    assert_eq!(
        h.claim_label("shared", ClaimKind::Apps).await,
        Some("shared-argo".to_string())
    );
}

#[test_log::test(tokio::test)]
async fn claim_index_rebuilds_from_labels() {
    let h = Harness::new();
    let ns = uniq("team");
    h.namespaces(&[&ns, "dev-1", "dev-2"]).await;
    let mut p = platform(&ns, "argo");
    p.spec.common.source_namespaces = vec!["dev-1".into(), "dev-2".into()];
    let key = h.create(&p).await;
    h.engine.reconcile(&key).await.unwrap();

    let rebuilt = Harness::new();
    for name in ["dev-1", "dev-2"] {
        let obj = h
            .child(ResourceKind::Namespace, None, name)
            .await
            .unwrap();
        rebuilt.store.seed(ResourceKind::Namespace, obj).await;
    }
    assert_eq!(rebuilt.engine.claims().rebuild_index().await.unwrap(), 2);
    assert_eq!(
        rebuilt.engine.claims().holder("dev-2", ClaimKind::Apps).await,
        Some(key.id())
    );
}

#[test_log::test(tokio::test)]
async fn appset_listing_a_foreign_namespace_leaves_it_untouched() {
    let h = Harness::new();
    let (ns_a, ns_b) = (uniq("team-a"), uniq("team-b"));
    h.namespaces(&[&ns_a, &ns_b, "ns1"]).await;

    let mut a = platform(&ns_a, "argo");
    a.spec.common.source_namespaces = vec!["ns1".into()];
    let key_a = h.create(&a).await;
    h.engine.reconcile(&key_a).await.unwrap();
    let labels_before = h.ns_labels("ns1").await;
    let roles_before = h.store.count(ResourceKind::Role).await;

    let mut b = platform(&ns_b, "argo");
    b.spec.common.application_set = Some(ApplicationSetSpec {
        source_namespaces: vec!["ns1".into()],
        ..Default::default()
    });
    let key_b = h.create(&b).await;
    h.engine.reconcile(&key_b).await.unwrap();

    assert_eq!(h.ns_labels("ns1").await, labels_before);
    assert_eq!(h.store.count(ResourceKind::Role).await, roles_before);
    assert_eq!(h.store.count(ResourceKind::RoleBinding).await, roles_before);
    assert!(!has_role(&h, "ns1", &rbac_name(&key_b, &ns_b, ClaimKind::AppSets)).await);
}

#[test_log::test(tokio::test)]
async fn deleting_an_instance_releases_every_claimed_namespace() {
    let h = Harness::new();
    let ns = uniq("team");
    let claimed = ["src-1", "src-2", "src-3"];
    h.namespaces(&[&ns]).await;
    h.namespaces(&claimed).await;

    let mut p = platform(&ns, "argo");
    p.spec.common.source_namespaces = vec!["src-*".into()];
    p.spec.common.application_set = Some(ApplicationSetSpec {
        source_namespaces: vec!["src-1".into(), "src-2".into()],
        ..Default::default()
    });
    p.spec.common.notifications = Some(NotificationsSpec {
        enabled: true,
        source_namespaces: vec!["src-3".into()],
        ..Default::default()
    });
    let key = h.create(&p).await;
    h.engine.reconcile(&key).await.unwrap();
    assert_eq!(h.store.count(ResourceKind::Role).await, 6);

    h.delete(&key).await;
    h.engine.reconcile(&key).await.unwrap();
    assert!(h.instance(&key).await.is_none());
    for ns in claimed {
        let labels = h.ns_labels(ns).await;
        for kind in ClaimKind::ALL {
            assert!(!labels.contains_key(kind.label_key()), "{ns} still has {kind}");
        }
    }
    assert_eq!(h.store.count(ResourceKind::Role).await, 0);
    assert_eq!(h.store.count(ResourceKind::RoleBinding).await, 0);
    assert!(h.engine.claims().claims_of(&key.id()).await.is_empty());

    // a second run over the already-clean state is a no-op
    assert_eq!(h.engine.reconcile(&key).await.unwrap(), None);
}
