use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Volume};

use super::Changes;
use crate::labels::{ANNOTATION_CACHE_TLS_CHECKSUM, preserve_reserved};

/// `0644`, filled in by the API server on file-backed volume sources.
pub const DEFAULT_VOLUME_MODE: i32 = 420;

/// Volumes with the modes the API server defaults made explicit, so a
/// rendered volume and its read-back form compare equal.
fn with_server_defaults(volumes: &Option<Vec<Volume>>) -> Option<Vec<Volume>> {
    let mut volumes = volumes.clone()?;
    for v in volumes.iter_mut() {
        if let Some(s) = v.secret.as_mut() {
            s.default_mode.get_or_insert(DEFAULT_VOLUME_MODE);
        }
        if let Some(c) = v.config_map.as_mut() {
            c.default_mode.get_or_insert(DEFAULT_VOLUME_MODE);
        }
        if let Some(p) = v.projected.as_mut() {
            p.default_mode.get_or_insert(DEFAULT_VOLUME_MODE);
        }
        if let Some(d) = v.downward_api.as_mut() {
            d.default_mode.get_or_insert(DEFAULT_VOLUME_MODE);
        }
    }
    Some(volumes)
}

/// Containers are matched by position. A different count or name at any
/// index replaces the whole list.
fn diff_containers(
    label: &str,
    live: &mut Vec<Container>,
    desired: &[Container],
    changes: &mut Changes,
) {
    let same_shape = live.len() == desired.len()
        && live.iter().zip(desired).all(|(l, d)| l.name == d.name);
    if !same_shape {
        *live = desired.to_vec();
        changes.push(format!("{label}s"));
        return;
    }
    for (l, d) in live.iter_mut().zip(desired) {
        changes.sync(&format!("{label} image"), &mut l.image, &d.image);
        changes.sync_set("image pull policy", &mut l.image_pull_policy, &d.image_pull_policy);
        changes.sync_vec("command", &mut l.command, &d.command);
        changes.sync_vec("args", &mut l.args, &d.args);
        changes.sync_vec("env", &mut l.env, &d.env);
        changes.sync_vec("volume mounts", &mut l.volume_mounts, &d.volume_mounts);
        changes.sync_vec("ports", &mut l.ports, &d.ports);
        changes.sync_set("resources", &mut l.resources, &d.resources);
        changes.sync_set("security context", &mut l.security_context, &d.security_context);
    }
}

fn diff_pod_spec(live: &mut PodSpec, desired: &PodSpec, changes: &mut Changes) {
    diff_containers("container", &mut live.containers, &desired.containers, changes);

    let mut live_init = live.init_containers.take().unwrap_or_default();
    diff_containers(
        "init container",
        &mut live_init,
        desired.init_containers.as_deref().unwrap_or_default(),
        changes,
    );
    live.init_containers = (!live_init.is_empty()).then_some(live_init);

    let mut live_volumes = with_server_defaults(&live.volumes);
    changes.sync_vec("volumes", &mut live_volumes, &with_server_defaults(&desired.volumes));
    live.volumes = live_volumes;
    changes.sync_set(
        "service account",
        &mut live.service_account_name,
        &desired.service_account_name,
    );
    changes.sync_set("pod security context", &mut live.security_context, &desired.security_context);

    let live_selector = live.node_selector.clone().filter(|m| !m.is_empty());
    let desired_selector = desired.node_selector.clone().filter(|m| !m.is_empty());
    if live_selector != desired_selector {
        live.node_selector = desired_selector;
        changes.push("node selector");
    }
    changes.sync_vec("tolerations", &mut live.tolerations, &desired.tolerations);
}

/// Pod template labels, annotations and spec.
///
/// A changed checksum annotation is reported on its own: it is enough to
/// roll the workload even when nothing else changed.
pub fn diff_pod_template(
    live: &mut PodTemplateSpec,
    desired: &PodTemplateSpec,
    changes: &mut Changes,
) {
    let live_meta = live.metadata.get_or_insert_with(Default::default);
    let desired_meta = desired.metadata.clone().unwrap_or_default();

    let mut labels = desired_meta.labels.clone();
    preserve_reserved(&mut labels, live_meta.labels.as_ref());
    if labels.clone().unwrap_or_default() != live_meta.labels.clone().unwrap_or_default() {
        live_meta.labels = labels;
        changes.push("pod labels");
    }

    let mut annotations = desired_meta.annotations.clone();
    preserve_reserved(&mut annotations, live_meta.annotations.as_ref());
    let wanted = annotations.clone().unwrap_or_default();
    let current = live_meta.annotations.clone().unwrap_or_default();
    if wanted != current {
        if wanted.get(ANNOTATION_CACHE_TLS_CHECKSUM) != current.get(ANNOTATION_CACHE_TLS_CHECKSUM) {
            changes.push("cache tls checksum");
        }
        let others_differ = wanted
            .iter()
            .filter(|(k, _)| k.as_str() != ANNOTATION_CACHE_TLS_CHECKSUM)
            .ne(current
                .iter()
                .filter(|(k, _)| k.as_str() != ANNOTATION_CACHE_TLS_CHECKSUM));
        if others_differ {
            changes.push("pod annotations");
        }
        live_meta.annotations = annotations;
    }

    match (live.spec.as_mut(), desired.spec.as_ref()) {
        (Some(l), Some(d)) => diff_pod_spec(l, d, changes),
        (None, Some(d)) => {
            live.spec = Some(d.clone());
            changes.push("pod spec");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EnvVar, SecretVolumeSource};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn container(name: &str, image: &str) -> Container {
        Container {
            name: name.into(),
            image: Some(image.into()),
            ..Default::default()
        }
    }

    fn template(containers: Vec<Container>, annotations: &[(&str, &str)]) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn positional_container_changes_aggregate() {
        let mut live = template(vec![container("server", "argocd:v1")], &[]);
        let mut want_c = container("server", "argocd:v2");
        want_c.image_pull_policy = Some("Always".into());
        want_c.env = Some(vec![EnvVar {
            name: "HTTP_PROXY".into(),
            value: Some("http://proxy".into()),
            ..Default::default()
        }]);
        let desired = template(vec![want_c], &[]);

        let mut changes = Changes::default();
        diff_pod_template(&mut live, &desired, &mut changes);
        assert_eq!(changes.list, vec!["container image", "image pull policy", "env"]);
        let spec = live.spec.unwrap();
        assert_eq!(spec.containers[0].image.as_deref(), Some("argocd:v2"));
    }

    #[test]
    fn server_defaulted_pull_policy_is_not_a_change() {
        let mut live_c = container("server", "argocd:v1");
        live_c.image_pull_policy = Some("IfNotPresent".into());
        let mut live = template(vec![live_c], &[]);
        let desired = template(vec![container("server", "argocd:v1")], &[]);
        let mut changes = Changes::default();
        diff_pod_template(&mut live, &desired, &mut changes);
        assert!(changes.list.is_empty());
    }

    #[test]
    fn server_defaulted_volume_mode_is_not_a_change() {
        let secret_volume = |mode: Option<i32>| Volume {
            name: "cache-tls".into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some("argo-cache-tls".into()),
                default_mode: mode,
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut live = template(vec![container("cache", "redis")], &[]);
        live.spec.as_mut().unwrap().volumes = Some(vec![secret_volume(Some(DEFAULT_VOLUME_MODE))]);
        let mut desired = template(vec![container("cache", "redis")], &[]);
        desired.spec.as_mut().unwrap().volumes = Some(vec![secret_volume(None)]);

        let mut changes = Changes::default();
        diff_pod_template(&mut live, &desired, &mut changes);
        assert!(changes.list.is_empty());

        desired.spec.as_mut().unwrap().volumes = Some(vec![secret_volume(Some(0o600))]);
        diff_pod_template(&mut live, &desired, &mut changes);
        assert_eq!(changes.list, vec!["volumes"]);
    }

    #[test]
    fn checksum_change_alone_is_reported() {
        let mut live = template(
            vec![container("repo", "argocd:v1")],
            &[(ANNOTATION_CACHE_TLS_CHECKSUM, "aaa")],
        );
        let desired = template(
            vec![container("repo", "argocd:v1")],
            &[(ANNOTATION_CACHE_TLS_CHECKSUM, "bbb")],
        );
        let mut changes = Changes::default();
        diff_pod_template(&mut live, &desired, &mut changes);
        assert_eq!(changes.list, vec!["cache tls checksum"]);
    }

    #[test]
    fn container_count_change_replaces_list() {
        let mut live = template(
            vec![container("cache", "redis"), container("sentinel", "redis")],
            &[],
        );
        let desired = template(vec![container("cache", "redis")], &[]);
        let mut changes = Changes::default();
        diff_pod_template(&mut live, &desired, &mut changes);
        assert_eq!(changes.list, vec!["containers"]);
        assert_eq!(live.spec.unwrap().containers.len(), 1);
    }
}
