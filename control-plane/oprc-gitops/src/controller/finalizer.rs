use std::fmt;
use std::sync::Arc;

use kube::core::DynamicObject;
use tracing::{info, warn};

use super::ReconcileErr;
use super::claims::SourceNamespaceManager;
use super::ownership::OwnershipRegistrar;
use super::timers::RenewalTimers;
use crate::crd::ManagedInstance;
use crate::labels::FINALIZER;
use crate::store::{ObjectStore, ResourceKind, delete_if_present, get_opt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerState {
    NoFinalizer,
    FinalizerPresent,
    Deleting,
    Removed,
}

impl FinalizerState {
    pub fn of(instance: &dyn ManagedInstance) -> Self {
        match (instance.has_finalizer(), instance.is_deleting()) {
            (false, false) => FinalizerState::NoFinalizer,
            (true, false) => FinalizerState::FinalizerPresent,
            (true, true) => FinalizerState::Deleting,
            (false, true) => FinalizerState::Removed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeStep {
    ReleaseClaims,
    DeleteClusterResources,
    CancelTimers,
    RemoveFinalizer,
}

impl fmt::Display for CascadeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CascadeStep::ReleaseClaims => "release claims",
            CascadeStep::DeleteClusterResources => "delete cluster resources",
            CascadeStep::CancelTimers => "cancel timers",
            CascadeStep::RemoveFinalizer => "remove finalizer",
        })
    }
}

/// Ordered cleanup run while an instance is being deleted. The finalizer
/// is only removed once every earlier step succeeded.
pub struct FinalizerCascade {
    store: Arc<dyn ObjectStore>,
    claims: Arc<SourceNamespaceManager>,
    timers: Arc<RenewalTimers>,
}

impl FinalizerCascade {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        claims: Arc<SourceNamespaceManager>,
        timers: Arc<RenewalTimers>,
    ) -> Self {
        Self {
            store,
            claims,
            timers,
        }
    }

    /// Persist the finalizer on a live instance. Returns whether a write
    /// happened.
    pub async fn ensure_finalizer(
        &self,
        instance: &dyn ManagedInstance,
        live: &DynamicObject,
    ) -> Result<bool, ReconcileErr> {
        if FinalizerState::of(instance) != FinalizerState::NoFinalizer {
            return Ok(false);
        }
        let kind = instance.resource_kind();
        let mut obj = live.clone();
        obj.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER.to_string());
        self.store
            .update(kind, &obj)
            .await
            .map_err(|e| ReconcileErr::write(kind, &instance.name(), e))?;
        info!(instance = %instance.id(), "finalizer added");
        Ok(true)
    }

    pub async fn run(&self, instance: &dyn ManagedInstance) -> Result<FinalizerState, ReconcileErr> {
        let state = FinalizerState::of(instance);
        if state != FinalizerState::Deleting {
            return Ok(state);
        }
        let id = instance.id();
        info!(instance = %id, "running deletion cascade");

        let released = self
            .claims
            .release_all(instance)
            .await
            .map_err(|e| e.in_step(CascadeStep::ReleaseClaims))?;

        let selector = OwnershipRegistrar::owned_selector(instance);
        let mut deleted = 0;
        for kind in [ResourceKind::ClusterRoleBinding, ResourceKind::ClusterRole] {
            let owned = self
                .store
                .list(kind, None, &selector)
                .await
                .map_err(|e| {
                    ReconcileErr::read(kind, "*", e).in_step(CascadeStep::DeleteClusterResources)
                })?;
            for obj in owned {
                let name = obj.metadata.name.unwrap_or_default();
                if delete_if_present(self.store.as_ref(), kind, None, &name)
                    .await
                    .map_err(|e| {
                        ReconcileErr::write(kind, &name, e)
                            .in_step(CascadeStep::DeleteClusterResources)
                    })?
                {
                    deleted += 1;
                }
            }
        }

        let cancelled = self.timers.cancel_all(&id);

        self.remove_finalizer(instance)
            .await
            .map_err(|e| e.in_step(CascadeStep::RemoveFinalizer))?;
        info!(
            instance = %id,
            released,
            deleted,
            cancelled,
            "deletion cascade finished"
        );
        Ok(FinalizerState::Removed)
    }

    async fn remove_finalizer(&self, instance: &dyn ManagedInstance) -> Result<(), ReconcileErr> {
        let key = instance.key();
        let Some(mut live) = get_opt(self.store.as_ref(), key.kind, key.namespace.as_deref(), &key.name)
            .await
            .map_err(|e| ReconcileErr::read(key.kind, &key.name, e))?
        else {
            return Ok(());
        };
        let Some(finalizers) = live.metadata.finalizers.as_mut() else {
            return Ok(());
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != FINALIZER);
        if finalizers.len() == before {
            return Ok(());
        }
        match self.store.update(key.kind, &live).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(instance = %key.id(), "instance vanished while removing finalizer");
                Ok(())
            }
            Err(e) => Err(ReconcileErr::write(key.kind, &key.name, e)),
        }
    }
}
