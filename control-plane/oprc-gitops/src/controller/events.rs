use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::debug;

use crate::crd::ManagedInstance;

pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_CLEANUP: &str = "Cleanup";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformEvent {
    pub kind: EventKind,
    pub reason: &'static str,
    pub action: &'static str,
    pub note: Option<String>,
}

impl PlatformEvent {
    pub fn normal(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason,
            action,
            note: Some(note.into()),
        }
    }

    pub fn warning(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason,
            action,
            note: Some(note.into()),
        }
    }
}

/// Fire-and-forget event publishing. Implementations swallow their own
/// failures.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, instance: &dyn ManagedInstance, event: PlatformEvent);
}

pub fn object_ref(instance: &dyn ManagedInstance) -> ObjectReference {
    let ar = instance.resource_kind().api_resource();
    ObjectReference {
        api_version: Some(ar.api_version),
        kind: Some(ar.kind),
        name: instance.meta().name.clone(),
        namespace: if instance.is_cluster_scoped() {
            None
        } else {
            instance.meta().namespace.clone()
        },
        uid: instance.meta().uid.clone(),
        ..Default::default()
    }
}

pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, instance: &dyn ManagedInstance, event: PlatformEvent) {
        let ev = Event {
            type_: match event.kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: event.reason.into(),
            note: event.note,
            action: event.action.into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, &object_ref(instance)).await {
            debug!(error = %e, "event publish failed");
        }
    }
}

pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, _: &dyn ManagedInstance, _: PlatformEvent) {}
}

/// Keeps published events in memory, keyed by instance identity.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(String, PlatformEvent)>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<(String, PlatformEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn reasons_for(&self, instance: &str) -> Vec<&'static str> {
        self.events()
            .into_iter()
            .filter(|(id, _)| id == instance)
            .map(|(_, e)| e.reason)
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, instance: &dyn ManagedInstance, event: PlatformEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((instance.id().label_value(), event));
        }
    }
}
