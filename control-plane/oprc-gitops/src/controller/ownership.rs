use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::crd::{ClaimKind, ManagedInstance};
use crate::desired::ChildResourceDescriptor;
use crate::labels::{LABEL_INSTANCE, Selector};

/// Stamps ownership onto desired child objects.
///
/// Every child carries the instance identity label. A controller owner
/// reference is added only where the API server can honour it: a
/// cluster-scoped instance may own anything, a namespaced instance only
/// objects in its own namespace. Everything else is cleaned up explicitly
/// by the finalizer cascade, found through the identity label.
#[derive(Clone, Copy, Debug, Default)]
pub struct OwnershipRegistrar;

impl OwnershipRegistrar {
    /// Name for a cluster-scoped child. Includes the target namespace so
    /// two namespaced instances with the same name never collide.
    pub fn cluster_scoped_name(instance: &dyn ManagedInstance, component: &str) -> String {
        format!(
            "{}-{}-{}",
            instance.name(),
            instance.target_namespace(),
            component
        )
    }

    /// Name of the Role and RoleBinding created in a claimed namespace.
    pub fn claim_rbac_name(instance: &dyn ManagedInstance, kind: ClaimKind) -> String {
        format!(
            "{}.{}.{}",
            instance.name(),
            instance.target_namespace(),
            kind.suffix()
        )
    }

    /// Selector matching every child stamped with this instance's identity.
    pub fn owned_selector(instance: &dyn ManagedInstance) -> Selector {
        Selector::eq(LABEL_INSTANCE, instance.id().label_value())
    }

    /// Owner reference for a child living in `child_namespace`
    /// (`None` for cluster-scoped children), if one is permitted.
    pub fn owner_reference_for(
        instance: &dyn ManagedInstance,
        child_namespace: Option<&str>,
    ) -> Option<OwnerReference> {
        let permitted = instance.is_cluster_scoped()
            || (child_namespace.is_some()
                && child_namespace == instance.meta().namespace.as_deref());
        if permitted {
            instance.owner_reference()
        } else {
            None
        }
    }

    pub fn decorate(&self, instance: &dyn ManagedInstance, descriptor: &mut ChildResourceDescriptor) {
        let owner = Self::owner_reference_for(instance, descriptor.namespace.as_deref());
        let label = instance.id().label_value();
        let Some(obj) = descriptor.desired_mut() else {
            return;
        };
        obj.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_INSTANCE.to_string(), label);
        match owner {
            Some(owner) => {
                let mut refs: Vec<OwnerReference> = obj
                    .metadata
                    .owner_references
                    .take()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|r| r.controller != Some(true))
                    .collect();
                refs.push(owner);
                obj.metadata.owner_references = Some(refs);
            }
            None => {
                if let Some(refs) = obj.metadata.owner_references.as_mut() {
                    refs.retain(|r| r.controller != Some(true));
                }
                if obj.metadata.owner_references.as_ref().is_some_and(Vec::is_empty) {
                    obj.metadata.owner_references = None;
                }
            }
        }
    }
}
