use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};

use super::pod::diff_pod_template;
use super::{Changes, TypedDiff};
use crate::store::ResourceKind;

pub struct DeploymentPolicy;

impl TypedDiff for DeploymentPolicy {
    type Object = Deployment;
    const KIND: ResourceKind = ResourceKind::Deployment;

    fn diff_typed(live: &mut Deployment, desired: &Deployment, changes: &mut Changes) {
        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        let Some(spec) = live.spec.as_mut() else {
            live.spec = Some(want.clone());
            changes.push("spec");
            return;
        };
        changes.immutable("selector", &spec.selector, &want.selector);
        changes.sync_set("replicas", &mut spec.replicas, &want.replicas);
        diff_pod_template(&mut spec.template, &want.template, changes);
    }
}

pub struct StatefulSetPolicy;

impl TypedDiff for StatefulSetPolicy {
    type Object = StatefulSet;
    const KIND: ResourceKind = ResourceKind::StatefulSet;

    fn diff_typed(live: &mut StatefulSet, desired: &StatefulSet, changes: &mut Changes) {
        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        let Some(spec) = live.spec.as_mut() else {
            live.spec = Some(want.clone());
            changes.push("spec");
            return;
        };
        changes.immutable("selector", &spec.selector, &want.selector);
        changes.immutable("service name", &spec.service_name, &want.service_name);
        changes.sync_set("replicas", &mut spec.replicas, &want.replicas);
        changes.sync_set(
            "pod management policy",
            &mut spec.pod_management_policy,
            &want.pod_management_policy,
        );
        diff_pod_template(&mut spec.template, &want.template, changes);
    }
}
