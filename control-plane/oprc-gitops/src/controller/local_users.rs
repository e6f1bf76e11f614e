use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ReconcileErr;
use super::ownership::OwnershipRegistrar;
use super::timers::{RenewalTimers, TimerKey};
use crate::crd::ManagedInstance;
use crate::crd::platform::LocalUserSpec;
use crate::labels::{
    ANNOTATION_LOCAL_USER, ANNOTATION_TOKEN_EXPIRES_AT, LABEL_COMPONENT, LABEL_INSTANCE,
    Selector, child_labels,
};
use crate::store::{
    ObjectStore, ResourceKind, delete_if_present, from_dynamic, get_opt, to_dynamic,
};

const COMPONENT: &str = "local-user";
const TOKEN_LEN: usize = 32;
const RETRY_DELAY: Duration = Duration::from_secs(60);

fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn expires_at(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    meta.annotations
        .as_ref()?
        .get(ANNOTATION_TOKEN_EXPIRES_AT)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn expiry_after(lifetime: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
}

/// What a renewal timer needs to rotate one user's token.
#[derive(Clone, Debug)]
pub struct RenewalTarget {
    pub key: TimerKey,
    pub namespace: String,
    pub secret: String,
    pub lifetime: Duration,
}

/// Token secrets for the instance's local users, with optional
/// scheduled renewal.
pub struct LocalUserManager {
    store: Arc<dyn ObjectStore>,
    timers: Arc<RenewalTimers>,
}

impl LocalUserManager {
    pub fn new(store: Arc<dyn ObjectStore>, timers: Arc<RenewalTimers>) -> Self {
        Self { store, timers }
    }

    pub fn secret_name(instance: &str, user: &str) -> String {
        format!("{instance}-local-user-{user}")
    }

    pub fn timer_key(instance: &dyn ManagedInstance, user: &str) -> TimerKey {
        TimerKey::new(instance.id(), format!("{COMPONENT}/{user}"))
    }

    pub async fn reconcile(
        self: &Arc<Self>,
        instance: &dyn ManagedInstance,
    ) -> Result<(), ReconcileErr> {
        let ns = instance.target_namespace();
        let users: Vec<&LocalUserSpec> = instance
            .common()
            .local_users
            .iter()
            .filter(|u| u.is_enabled())
            .collect();

        let mut errors = Vec::new();
        for user in &users {
            if let Err(e) = self.ensure_user(instance, &ns, user).await {
                errors.push(e);
            }
        }

        let wanted: BTreeSet<&str> = users.iter().map(|u| u.name.as_str()).collect();
        let owned = self
            .store
            .list(
                ResourceKind::Secret,
                Some(&ns),
                &Selector::eq(LABEL_INSTANCE, instance.id().label_value()),
            )
            .await
            .map_err(|e| ReconcileErr::read(ResourceKind::Secret, "*", e))?;
        for secret in owned.iter().filter(|s| is_local_user_secret(s)) {
            let user = secret
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_LOCAL_USER))
                .cloned()
                .unwrap_or_default();
            if wanted.contains(user.as_str()) {
                continue;
            }
            let name = secret.metadata.name.clone().unwrap_or_default();
            info!(secret = %name, user = %user, "removing local user token");
            self.timers.cancel(&Self::timer_key(instance, &user));
            if let Err(e) =
                delete_if_present(self.store.as_ref(), ResourceKind::Secret, Some(&ns), &name).await
            {
                errors.push(ReconcileErr::write(ResourceKind::Secret, &name, e));
            }
        }

        let renewing: BTreeSet<TimerKey> = users
            .iter()
            .filter(|u| u.auto_renew && u.lifetime().is_some())
            .map(|u| Self::timer_key(instance, &u.name))
            .collect();
        for key in self.timers.keys_for(&instance.id()) {
            if key.sub.starts_with(COMPONENT) && !renewing.contains(&key) {
                self.timers.cancel(&key);
            }
        }
        ReconcileErr::collect(errors)
    }

    async fn ensure_user(
        self: &Arc<Self>,
        instance: &dyn ManagedInstance,
        ns: &str,
        user: &LocalUserSpec,
    ) -> Result<(), ReconcileErr> {
        let name = Self::secret_name(&instance.name(), &user.name);
        let key = Self::timer_key(instance, &user.name);
        let target = RenewalTarget {
            key: key.clone(),
            namespace: ns.to_string(),
            secret: name.clone(),
            lifetime: user.lifetime().unwrap_or_default(),
        };

        let live = get_opt(self.store.as_ref(), ResourceKind::Secret, Some(ns), &name)
            .await
            .map_err(|e| ReconcileErr::read(ResourceKind::Secret, &name, e))?;
        let expiry = match live {
            None => {
                let expiry = user.lifetime().and_then(expiry_after);
                let secret = self.secret(instance, ns, &name, user, expiry)?;
                self.store
                    .create(ResourceKind::Secret, &secret)
                    .await
                    .map_err(|e| ReconcileErr::write(ResourceKind::Secret, &name, e))?;
                info!(secret = %name, user = %user.name, "local user token issued");
                expiry
            }
            Some(obj) => match (user.lifetime(), expires_at(&obj.metadata)) {
                (Some(_), Some(t)) if t <= Utc::now() => self.rotate(&target).await?,
                (Some(_), None) => self.rotate(&target).await?,
                (_, t) => t,
            },
        };

        match (user.auto_renew, user.lifetime(), expiry) {
            (true, Some(_), Some(at)) => {
                if !self.timers.is_scheduled(&key) {
                    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    self.arm(target, delay);
                }
            }
            _ => {
                self.timers.cancel(&key);
            }
        }
        Ok(())
    }

    fn secret(
        &self,
        instance: &dyn ManagedInstance,
        ns: &str,
        name: &str,
        user: &LocalUserSpec,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<DynamicObject, ReconcileErr> {
        let mut annotations =
            BTreeMap::from([(ANNOTATION_LOCAL_USER.to_string(), user.name.clone())]);
        if let Some(at) = expiry {
            annotations.insert(ANNOTATION_TOKEN_EXPIRES_AT.to_string(), at.to_rfc3339());
        }
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(child_labels(&instance.id().label_value(), name, COMPONENT)),
                annotations: Some(annotations),
                owner_references: OwnershipRegistrar::owner_reference_for(instance, Some(ns))
                    .map(|r| vec![r]),
                ..Default::default()
            },
            type_: Some("Opaque".into()),
            data: Some(BTreeMap::from([
                ("username".to_string(), ByteString(user.name.clone().into_bytes())),
                ("token".to_string(), ByteString(generate_token().into_bytes())),
            ])),
            ..Default::default()
        };
        to_dynamic(ResourceKind::Secret, &secret).map_err(|e| ReconcileErr::Internal(e.to_string()))
    }

    /// Replace the token and push the expiry out by one lifetime. Returns
    /// the new expiry, or `None` when the secret no longer exists.
    pub async fn rotate(
        &self,
        target: &RenewalTarget,
    ) -> Result<Option<DateTime<Utc>>, ReconcileErr> {
        let name = &target.secret;
        let Some(obj) =
            get_opt(self.store.as_ref(), ResourceKind::Secret, Some(&target.namespace), name)
                .await
                .map_err(|e| ReconcileErr::read(ResourceKind::Secret, name, e))?
        else {
            return Ok(None);
        };
        let internal = |e: crate::store::StoreError| ReconcileErr::Internal(e.to_string());
        let mut secret: Secret = from_dynamic(ResourceKind::Secret, &obj).map_err(internal)?;
        let expiry = expiry_after(target.lifetime);
        secret
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert("token".into(), ByteString(generate_token().into_bytes()));
        let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
        match expiry {
            Some(at) => annotations.insert(ANNOTATION_TOKEN_EXPIRES_AT.into(), at.to_rfc3339()),
            None => annotations.remove(ANNOTATION_TOKEN_EXPIRES_AT),
        };
        let updated = to_dynamic(ResourceKind::Secret, &secret).map_err(internal)?;
        self.store
            .update(ResourceKind::Secret, &updated)
            .await
            .map_err(|e| ReconcileErr::write(ResourceKind::Secret, name, e))?;
        info!(secret = %name, "local user token rotated");
        Ok(expiry)
    }

    fn arm(self: &Arc<Self>, target: RenewalTarget, delay: Duration) {
        let mgr = Arc::clone(self);
        let key = target.key.clone();
        self.timers.schedule(key, delay, move |token| mgr.renew(target, token));
    }

    /// Rotate, then re-arm through the running timer's token so a cascade
    /// that cancelled it in the meantime wins.
    fn renew(
        self: Arc<Self>,
        target: RenewalTarget,
        token: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let delay = match self.rotate(&target).await {
                Ok(Some(_)) => target.lifetime,
                Ok(None) => {
                    debug!(secret = %target.secret, "secret gone, renewal stopped");
                    return;
                }
                Err(e) => {
                    warn!(secret = %target.secret, error = %e, "token renewal failed");
                    RETRY_DELAY
                }
            };
            let key = target.key.clone();
            let mgr = Arc::clone(&self);
            let rearmed = self
                .timers
                .reschedule(&token, key, delay, move |token| mgr.renew(target, token));
            if !rearmed {
                debug!("instance timers cancelled, renewal stopped");
            }
        })
    }
}

fn is_local_user_secret(obj: &DynamicObject) -> bool {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_COMPONENT))
        .is_some_and(|c| c == COMPONENT)
}
