use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info, instrument, warn};

use super::ReconcileErr;
use super::children::ChildResourceReconciler;
use super::claims::{self, SourceNamespaceManager};
use super::events::{
    EventSink, PlatformEvent, REASON_CLEANUP, REASON_RECONCILE_FAILED, REASON_RECONCILED,
    REASON_VALIDATION_FAILED,
};
use super::finalizer::{FinalizerCascade, FinalizerState};
use super::local_users::LocalUserManager;
use super::ownership::OwnershipRegistrar;
use super::registry::InstanceRegistry;
use super::status::{CHECKSUM_CACHE_TLS, StatusUpdate};
use super::timers::RenewalTimers;
use crate::apis::ApiDetector;
use crate::crd::{InstanceKey, ManagedInstance, Phase, instance_from_dynamic};
use crate::desired::{BuildContext, DesiredStateBuilder, tls_checksum};
use crate::diff::DiffPolicyTable;
use crate::labels::Selector;
use crate::store::{ObjectStore, ResourceKind, from_dynamic, get_opt};

#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Only instances matching this selector are reconciled. Empty matches all.
    pub label_selector: String,
    pub resync: Duration,
    pub conflict_requeue: Duration,
    pub error_requeue: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            label_selector: String::new(),
            resync: Duration::from_secs(300),
            conflict_requeue: Duration::from_secs(5),
            error_requeue: Duration::from_secs(60),
        }
    }
}

/// One reconcile pass per instance key; shared by both platform variants.
pub struct Engine {
    store: Arc<dyn ObjectStore>,
    builder: Arc<dyn DesiredStateBuilder>,
    children: ChildResourceReconciler,
    registrar: OwnershipRegistrar,
    claims: Arc<SourceNamespaceManager>,
    timers: Arc<RenewalTimers>,
    local_users: Arc<LocalUserManager>,
    cascade: FinalizerCascade,
    registry: Arc<InstanceRegistry>,
    events: Arc<dyn EventSink>,
    apis: Arc<ApiDetector>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        builder: Arc<dyn DesiredStateBuilder>,
        events: Arc<dyn EventSink>,
        registry: Arc<InstanceRegistry>,
        settings: EngineSettings,
    ) -> Self {
        let children =
            ChildResourceReconciler::new(store.clone(), Arc::new(DiffPolicyTable::standard()));
        let timers = Arc::new(RenewalTimers::new());
        let claims = Arc::new(SourceNamespaceManager::new(store.clone(), children.clone()));
        Self {
            local_users: Arc::new(LocalUserManager::new(store.clone(), timers.clone())),
            cascade: FinalizerCascade::new(store.clone(), claims.clone(), timers.clone()),
            registrar: OwnershipRegistrar,
            store,
            builder,
            children,
            claims,
            timers,
            registry,
            events,
            apis: Arc::new(ApiDetector::default()),
            settings,
        }
    }

    /// Replace the default detector, which assumes a plain Kubernetes
    /// cluster without Routes.
    pub fn with_api_detector(mut self, apis: Arc<ApiDetector>) -> Self {
        self.apis = apis;
        self
    }

    pub fn apis(&self) -> &Arc<ApiDetector> {
        &self.apis
    }

    pub fn claims(&self) -> &Arc<SourceNamespaceManager> {
        &self.claims
    }

    pub fn timers(&self) -> &Arc<RenewalTimers> {
        &self.timers
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Returns how long to wait before the next pass, or `None` to wait
    /// for the next change.
    #[instrument(level = "debug", skip_all, fields(instance = %key.id()))]
    pub async fn reconcile(&self, key: &InstanceKey) -> Result<Option<Duration>, ReconcileErr> {
        let id = key.id();
        let Some(live) = get_opt(self.store.as_ref(), key.kind, key.namespace.as_deref(), &key.name)
            .await
            .map_err(|e| ReconcileErr::read(key.kind, &key.name, e))?
        else {
            debug!("instance is gone");
            self.registry.forget(&id);
            return Ok(None);
        };
        let instance = instance_from_dynamic(key.kind, &live)
            .map_err(|e| ReconcileErr::Validation(e.to_string()))?;
        let instance = instance.as_ref();

        if instance.is_deleting() {
            self.registry.record_attempt(&id);
            return self.finalize(instance).await;
        }

        let selector = match self.settings.label_selector.parse::<Selector>() {
            Ok(s) => s,
            Err(e) => {
                let err = ReconcileErr::Validation(format!("label selector: {e}"));
                return self.fail_validation(instance, err).await;
            }
        };
        if !selector.matches(instance.labels()) {
            debug!(selector = %selector, "instance does not match label selector, skipping");
            self.registry.forget(&id);
            return Ok(None);
        }
        self.registry.record_attempt(&id);
        if let Err(err) = claims::validate_patterns(instance) {
            return self.fail_validation(instance, err).await;
        }

        self.cascade.ensure_finalizer(instance, &live).await?;

        let checksum = if instance.common().tls_enabled() {
            self.cache_tls_checksum(instance).await?
        } else {
            None
        };
        let ctx = BuildContext {
            instance,
            tls_checksum: checksum.clone(),
            exposure: self.apis.preferred_exposure().await,
        };
        let mut descriptors = self.builder.build(&ctx).map_err(ReconcileErr::internal)?;

        let mut errors = Vec::new();
        let mut applied = 0usize;
        for desc in descriptors.iter_mut() {
            self.registrar.decorate(instance, desc);
            match self.children.reconcile(desc).await {
                Ok(action) if action.is_write() => applied += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(kind = %desc.kind, name = %desc.name, error = %e, "child reconcile failed");
                    errors.push(e);
                }
            }
        }
        if let Err(e) = self.local_users.reconcile(instance).await {
            errors.push(e);
        }
        if let Err(e) = self.claims.reconcile(instance).await {
            errors.push(e);
        }

        if applied > 0 {
            info!(applied, "child objects converged");
            self.events
                .publish(
                    instance,
                    PlatformEvent::normal(
                        REASON_RECONCILED,
                        "Reconcile",
                        format!("applied {applied} change(s)"),
                    ),
                )
                .await;
        }

        let (conflicts, failures): (Vec<_>, Vec<_>) = errors
            .into_iter()
            .flat_map(ReconcileErr::into_leaves)
            .partition(ReconcileErr::is_conflict);
        let generation = instance.meta().generation;

        if failures.is_empty() {
            if !conflicts.is_empty() {
                debug!(conflicts = conflicts.len(), "write conflicts, requeueing");
                return Ok(Some(self.settings.conflict_requeue));
            }
            let update = StatusUpdate::new(Phase::Available, "Reconciled", generation)
                .with_checksum(CHECKSUM_CACHE_TLS, checksum);
            self.write_status(instance, &update).await?;
            self.registry.observe(&id, Phase::Available);
            return Ok(Some(self.settings.resync));
        }

        let err = match ReconcileErr::collect(failures) {
            Err(e) => e,
            Ok(()) => ReconcileErr::Internal("failure list was empty".into()),
        };
        let update = StatusUpdate::new(Phase::Failed, err.to_string(), generation)
            .with_checksum(CHECKSUM_CACHE_TLS, checksum);
        if let Err(e) = self.write_status(instance, &update).await {
            warn!(error = %e, "failed to record failure status");
        }
        self.registry.observe(&id, Phase::Failed);
        self.events
            .publish(
                instance,
                PlatformEvent::warning(REASON_RECONCILE_FAILED, "Reconcile", err.to_string()),
            )
            .await;
        Err(err)
    }

    async fn finalize(&self, instance: &dyn ManagedInstance) -> Result<Option<Duration>, ReconcileErr> {
        let id = instance.id();
        if FinalizerState::of(instance) != FinalizerState::Deleting {
            self.registry.forget(&id);
            return Ok(None);
        }
        let update = StatusUpdate::new(Phase::Unknown, "Deleting", instance.meta().generation);
        if let Err(e) = self.write_status(instance, &update).await {
            debug!(error = %e, "could not mark instance as deleting");
        }
        self.registry.observe(&id, Phase::Unknown);

        match self.cascade.run(instance).await {
            Ok(_) => {
                self.events
                    .publish(
                        instance,
                        PlatformEvent::normal(REASON_CLEANUP, "Delete", "owned resources released"),
                    )
                    .await;
                self.registry.forget(&id);
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "deletion cascade failed, finalizer retained");
                self.events
                    .publish(
                        instance,
                        PlatformEvent::warning(REASON_CLEANUP, "Delete", e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn fail_validation(
        &self,
        instance: &dyn ManagedInstance,
        err: ReconcileErr,
    ) -> Result<Option<Duration>, ReconcileErr> {
        warn!(error = %err, "instance failed validation");
        let update = StatusUpdate::new(Phase::Failed, err.to_string(), instance.meta().generation);
        if let Err(e) = self.write_status(instance, &update).await {
            warn!(error = %e, "failed to record validation status");
        }
        self.registry.observe(&instance.id(), Phase::Failed);
        self.events
            .publish(
                instance,
                PlatformEvent::warning(REASON_VALIDATION_FAILED, "Validate", err.to_string()),
            )
            .await;
        Err(err)
    }

    async fn cache_tls_checksum(
        &self,
        instance: &dyn ManagedInstance,
    ) -> Result<Option<String>, ReconcileErr> {
        let ns = instance.target_namespace();
        let name = format!("{}-cache-tls", instance.name());
        let Some(obj) = get_opt(self.store.as_ref(), ResourceKind::Secret, Some(&ns), &name)
            .await
            .map_err(|e| ReconcileErr::read(ResourceKind::Secret, &name, e))?
        else {
            debug!(secret = %name, "cache tls secret not present yet");
            return Ok(None);
        };
        let secret: Secret =
            from_dynamic(ResourceKind::Secret, &obj).map_err(ReconcileErr::internal)?;
        Ok(Some(tls_checksum(&secret)))
    }

    async fn write_status(
        &self,
        instance: &dyn ManagedInstance,
        update: &StatusUpdate,
    ) -> Result<(), ReconcileErr> {
        if !update.differs_from(instance.status()) {
            return Ok(());
        }
        let key = instance.key();
        let status = serde_json::to_value(update.render(instance.status()))
            .map_err(ReconcileErr::internal)?;
        self.store
            .update_status(key.kind, key.namespace.as_deref(), &key.name, &status)
            .await
            .map_err(|e| ReconcileErr::write(key.kind, &key.name, e))
    }

    /// Stop background work. Called once on shutdown.
    pub fn shutdown(&self) {
        self.timers.shutdown();
        self.registry.shutdown();
    }
}
