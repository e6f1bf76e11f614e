use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, SecretVolumeSource, Volume, VolumeMount,
};

use super::ChildResourceDescriptor;
use super::common::{
    CACHE_PORT, Renderer, SENTINEL_PORT, container_port, resources, strings, tcp_port,
};
use crate::diff::pod::DEFAULT_VOLUME_MODE;
use crate::store::{ResourceKind, StoreResult};

const TLS_MOUNT: &str = "/app/config/redis/tls";
const COMPONENT: &str = "cache";

/// Writes redis.conf and sentinel.conf for the pod's ordinal. The first
/// replica starts as master; the rest follow it through the headless service.
const HA_CONFIG_SCRIPT: &str = r#"set -e
mkdir -p /data/conf
ORDINAL="${HOSTNAME##*-}"
MASTER="${SERVICE_NAME}-server-0.${SERVICE_NAME}"
{
  echo "port ${CACHE_PORT}"
  echo "dir /data"
  echo "save \"\""
  echo "appendonly no"
  if [ "$ORDINAL" != "0" ]; then echo "replicaof ${MASTER} ${CACHE_PORT}"; fi
} > /data/conf/redis.conf
{
  echo "port ${SENTINEL_PORT}"
  echo "sentinel resolve-hostnames yes"
  echo "sentinel monitor cache ${MASTER} ${CACHE_PORT} 2"
  echo "sentinel down-after-milliseconds cache 10000"
  echo "sentinel failover-timeout cache 180000"
} > /data/conf/sentinel.conf
"#;

fn tls_args() -> Vec<String> {
    strings(&[
        "--tls-port",
        "6379",
        "--port",
        "0",
        "--tls-cert-file",
        "/app/config/redis/tls/tls.crt",
        "--tls-key-file",
        "/app/config/redis/tls/tls.key",
        "--tls-auth-clients",
        "no",
    ])
}

fn tls_volume(r: &Renderer<'_>) -> Volume {
    Volume {
        name: "cache-tls".into(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(r.child_name("cache-tls")),
            default_mode: Some(DEFAULT_VOLUME_MODE),
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tls_mount() -> VolumeMount {
    VolumeMount {
        name: "cache-tls".into(),
        mount_path: TLS_MOUNT.into(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Single-replica cache Deployment, or the HA StatefulSet with a sentinel
/// sidecar. Whichever shape is not selected is emitted as absent.
pub fn cache(r: &Renderer<'_>, out: &mut Vec<ChildResourceDescriptor>) -> StoreResult<()> {
    let spec = r.spec();
    let name = r.child_name("cache");
    let ha_name = r.child_name("cache-ha-server");
    let ha_svc = r.child_name("cache-ha");
    let workload = &[ResourceKind::Deployment, ResourceKind::Service];

    if !spec.cache_enabled() {
        let reason = "cache is disabled";
        r.absent(out, &[ResourceKind::ServiceAccount], &name, COMPONENT, reason);
        r.absent(out, workload, &name, COMPONENT, reason);
        r.absent(out, &[ResourceKind::StatefulSet], &ha_name, COMPONENT, reason);
        r.absent(out, &[ResourceKind::Service], &ha_svc, COMPONENT, reason);
        return Ok(());
    }

    out.push(ChildResourceDescriptor::present(
        ResourceKind::ServiceAccount,
        COMPONENT,
        &r.service_account(&name, COMPONENT),
    )?);

    let tls = spec.tls_enabled();
    let cache_spec = spec.cache.clone().unwrap_or_default();

    if spec.ha_enabled() {
        r.absent(out, workload, &name, COMPONENT, "ha is enabled");

        let mut cache = r.container("cache", r.cache_image());
        cache.command = Some(strings(&["redis-server"]));
        let mut args = strings(&["/data/conf/redis.conf"]);
        if tls {
            args.extend(tls_args());
        }
        cache.args = Some(args);
        cache.env = r.env(&[]);
        cache.resources = resources(spec.ha.resources.as_ref().or(cache_spec.resources.as_ref()));
        cache.ports = Some(vec![container_port("cache", CACHE_PORT)]);
        let mut mounts = vec![VolumeMount {
            name: "data".into(),
            mount_path: "/data".into(),
            ..Default::default()
        }];
        if tls {
            mounts.push(tls_mount());
        }
        cache.volume_mounts = Some(mounts.clone());

        let mut sentinel = r.container("sentinel", r.cache_image());
        sentinel.command = Some(strings(&["redis-sentinel"]));
        sentinel.args = Some(strings(&["/data/conf/sentinel.conf"]));
        sentinel.env = r.env(&[]);
        sentinel.ports = Some(vec![container_port("sentinel", SENTINEL_PORT)]);
        sentinel.volume_mounts = Some(mounts[..1].to_vec());

        let mut init = r.container("config-init", r.cache_image());
        init.command = Some(strings(&["sh", "-c", HA_CONFIG_SCRIPT]));
        init.env = Some(vec![
            env("SERVICE_NAME", &ha_svc),
            env("CACHE_PORT", &CACHE_PORT.to_string()),
            env("SENTINEL_PORT", &SENTINEL_PORT.to_string()),
        ]);
        init.volume_mounts = Some(mounts[..1].to_vec());

        let mut pod = r.pod_spec(&name, vec![cache, sentinel]);
        pod.init_containers = Some(vec![init]);
        let mut volumes = vec![Volume {
            name: "data".into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }];
        if tls {
            volumes.push(tls_volume(r));
        }
        pod.volumes = Some(volumes);

        let sts = StatefulSet {
            metadata: r.meta(&ha_name, COMPONENT),
            spec: Some(StatefulSetSpec {
                replicas: Some(3),
                service_name: ha_svc.clone(),
                pod_management_policy: Some("OrderedReady".into()),
                selector: r.selector(&ha_name),
                template: r.pod_template(&ha_name, COMPONENT, pod),
                ..Default::default()
            }),
            ..Default::default()
        };
        out.push(ChildResourceDescriptor::present(ResourceKind::StatefulSet, COMPONENT, &sts)?);

        let mut svc = r.service(
            &ha_svc,
            COMPONENT,
            &ha_name,
            vec![tcp_port("cache", CACHE_PORT), tcp_port("sentinel", SENTINEL_PORT)],
            None,
        );
        if let Some(s) = svc.spec.as_mut() {
            s.publish_not_ready_addresses = Some(true);
        }
        out.push(ChildResourceDescriptor::present(ResourceKind::Service, COMPONENT, &svc)?);
    } else {
        r.absent(out, &[ResourceKind::StatefulSet], &ha_name, COMPONENT, "ha is disabled");
        r.absent(out, &[ResourceKind::Service], &ha_svc, COMPONENT, "ha is disabled");

        let mut cache = r.container("cache", r.cache_image());
        let mut args = strings(&["--save", "", "--appendonly", "no"]);
        if tls {
            args.extend(tls_args());
            cache.volume_mounts = Some(vec![tls_mount()]);
        }
        cache.args = Some(args);
        cache.env = r.env(&[]);
        cache.resources = resources(cache_spec.resources.as_ref());
        cache.ports = Some(vec![container_port("cache", CACHE_PORT)]);

        let mut pod = r.pod_spec(&name, vec![cache]);
        if tls {
            pod.volumes = Some(vec![tls_volume(r)]);
        }
        out.push(ChildResourceDescriptor::present(
            ResourceKind::Deployment,
            COMPONENT,
            &r.deployment(&name, COMPONENT, 1, pod),
        )?);
        out.push(ChildResourceDescriptor::present(
            ResourceKind::Service,
            COMPONENT,
            &r.service(&name, COMPONENT, &name, vec![tcp_port("cache", CACHE_PORT)], None),
        )?);
    }
    Ok(())
}

fn env(name: &str, value: &str) -> k8s_openapi::api::core::v1::EnvVar {
    k8s_openapi::api::core::v1::EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}
