pub mod children;
pub mod claims;
pub mod engine;
pub mod events;
pub mod finalizer;
pub mod local_users;
pub mod ownership;
pub mod registry;
pub mod status;
pub mod timers;

pub use engine::{Engine, EngineSettings};

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::{self, Action};
use kube::runtime::{Controller, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{error, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{ClusterGitOpsPlatform, GitOpsPlatform, InstanceKey};
use crate::store::{ResourceKind, StoreError};
use finalizer::CascadeStep;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("reading {kind} '{name}': {source}")]
    Read {
        kind: ResourceKind,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("writing {kind} '{name}': {source}")]
    Write {
        kind: ResourceKind,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("conflict on {kind} '{name}': {source}")]
    Conflict {
        kind: ResourceKind,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{step} failed: {source}")]
    Cascade {
        step: CascadeStep,
        #[source]
        source: Box<ReconcileErr>,
    },
    #[error("{}", join(.0))]
    Aggregate(Vec<ReconcileErr>),
    #[error("internal error: {0}")]
    Internal(String),
}

fn join(errors: &[ReconcileErr]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ReconcileErr {
    pub fn read(kind: ResourceKind, name: &str, source: StoreError) -> Self {
        ReconcileErr::Read {
            kind,
            name: name.to_string(),
            source,
        }
    }

    /// Write failure; optimistic-concurrency losses become [`ReconcileErr::Conflict`].
    pub fn write(kind: ResourceKind, name: &str, source: StoreError) -> Self {
        if source.is_conflict() {
            ReconcileErr::Conflict {
                kind,
                name: name.to_string(),
                source,
            }
        } else {
            ReconcileErr::Write {
                kind,
                name: name.to_string(),
                source,
            }
        }
    }

    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        ReconcileErr::Internal(e.to_string())
    }

    pub fn in_step(self, step: CascadeStep) -> Self {
        ReconcileErr::Cascade {
            step,
            source: Box::new(self),
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            ReconcileErr::Conflict { .. } => true,
            ReconcileErr::Cascade { source, .. } => source.is_conflict(),
            ReconcileErr::Aggregate(errors) => {
                !errors.is_empty() && errors.iter().all(ReconcileErr::is_conflict)
            }
            _ => false,
        }
    }

    /// Flatten nested aggregates.
    pub fn into_leaves(self) -> Vec<ReconcileErr> {
        match self {
            ReconcileErr::Aggregate(errors) => {
                errors.into_iter().flat_map(ReconcileErr::into_leaves).collect()
            }
            other => vec![other],
        }
    }

    pub fn collect(errors: Vec<ReconcileErr>) -> Result<(), ReconcileErr> {
        let mut leaves: Vec<_> = errors.into_iter().flat_map(ReconcileErr::into_leaves).collect();
        match leaves.len() {
            0 => Ok(()),
            1 => Err(leaves.remove(0)),
            _ => Err(ReconcileErr::Aggregate(leaves)),
        }
    }
}

#[derive(Clone)]
pub struct ControllerContext {
    pub engine: Arc<Engine>,
    pub cfg: OperatorConfig,
}

impl ControllerContext {
    fn action(&self, outcome: Option<Duration>) -> Action {
        match outcome {
            Some(after) => Action::requeue(after),
            None => Action::await_change(),
        }
    }
}

/// Run a controller per enabled platform variant until the watch streams end.
pub async fn run_controller(client: Client, ctx: Arc<ControllerContext>) -> anyhow::Result<()> {
    let cfg = &ctx.cfg;
    let config = controller::Config::default().concurrency(cfg.workers);

    let namespaced = cfg.features.namespaced.unwrap_or(true).then(|| {
        Controller::new(Api::<GitOpsPlatform>::all(client.clone()), watcher::Config::default())
            .with_config(config.clone())
            .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
            .owns(Api::<StatefulSet>::all(client.clone()), watcher::Config::default())
            .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
            .run(reconcile_namespaced, error_policy, ctx.clone())
            .for_each(|res| async move {
                match res {
                    Ok((obj, action)) => info!(instance = %obj.name, "reconciled: requeue={:?}", action),
                    Err(e) => error!(error = ?e, "reconcile error"),
                }
            })
    });
    // Owner refs from a cluster-scoped parent cannot be mapped back through
    // `owns`, so the cluster variant relies on the periodic resync.
    let cluster = cfg.features.cluster_scoped.unwrap_or(false).then(|| {
        Controller::new(
            Api::<ClusterGitOpsPlatform>::all(client.clone()),
            watcher::Config::default(),
        )
        .with_config(config.clone())
        .run(reconcile_cluster, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => info!(instance = %obj.name, "reconciled: requeue={:?}", action),
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
    });

    info!(
        namespaced = namespaced.is_some(),
        cluster_scoped = cluster.is_some(),
        workers = cfg.workers,
        "starting controllers"
    );
    match (namespaced, cluster) {
        (Some(a), Some(b)) => {
            futures_util::future::join(a, b).await;
        }
        (Some(a), None) => a.await,
        (None, Some(b)) => b.await,
        (None, None) => warn!("no platform variant enabled, nothing to do"),
    }
    ctx.engine.shutdown();
    Ok(())
}

async fn reconcile_namespaced(
    obj: Arc<GitOpsPlatform>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let ns = obj.namespace().unwrap_or_else(|| "default".to_string());
    let key = InstanceKey::namespaced(ns, obj.name_any());
    let outcome = ctx.engine.reconcile(&key).await?;
    Ok(ctx.action(outcome))
}

async fn reconcile_cluster(
    obj: Arc<ClusterGitOpsPlatform>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let key = InstanceKey::cluster(obj.name_any());
    let outcome = ctx.engine.reconcile(&key).await?;
    Ok(ctx.action(outcome))
}

fn error_policy<K: Resource>(
    obj: Arc<K>,
    err: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    let settings = ctx.engine.settings();
    let after = if err.is_conflict() {
        settings.conflict_requeue
    } else {
        settings.error_requeue
    };
    warn!(instance = %obj.meta().name.clone().unwrap_or_default(), error = %err, ?after, "reconcile failed");
    Action::requeue(after)
}
