use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use tracing::debug;

use crate::crd::{InstanceId, Phase};

#[derive(Default)]
struct Entry {
    phase: Option<Phase>,
    attempts: u64,
}

/// Process-wide view of which instances are active and in what phase.
///
/// Constructed once at startup and handed to the engine; it only feeds
/// counters and never influences reconciliation.
pub struct InstanceRegistry {
    entries: Mutex<HashMap<InstanceId, Entry>>,
    active: UpDownCounter<i64>,
    attempts: Counter<u64>,
    closed: AtomicBool,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::with_meter(&opentelemetry::global::meter("oprc-gitops"))
    }

    pub fn with_meter(meter: &Meter) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            active: meter
                .i64_up_down_counter("oprc_gitops.instances.active")
                .with_description("Managed instances by phase")
                .build(),
            attempts: meter
                .u64_counter("oprc_gitops.reconcile.attempts")
                .with_description("Reconcile passes per instance")
                .build(),
            closed: AtomicBool::new(false),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn record_attempt(&self, id: &InstanceId) {
        if self.is_closed() {
            return;
        }
        self.entries().entry(id.clone()).or_default().attempts += 1;
        self.attempts
            .add(1, &[KeyValue::new("instance", id.label_value())]);
    }

    pub fn observe(&self, id: &InstanceId, phase: Phase) {
        if self.is_closed() {
            return;
        }
        let previous = {
            let mut entries = self.entries();
            let entry = entries.entry(id.clone()).or_default();
            entry.phase.replace(phase)
        };
        if previous == Some(phase) {
            return;
        }
        if let Some(old) = previous {
            self.active
                .add(-1, &[KeyValue::new("phase", old.as_str())]);
        }
        self.active.add(1, &[KeyValue::new("phase", phase.as_str())]);
        debug!(instance = %id, ?previous, ?phase, "registry: phase changed");
    }

    pub fn forget(&self, id: &InstanceId) {
        let removed = self.entries().remove(id);
        if let Some(phase) = removed.and_then(|e| e.phase) {
            self.active
                .add(-1, &[KeyValue::new("phase", phase.as_str())]);
        }
    }

    pub fn phase(&self, id: &InstanceId) -> Option<Phase> {
        self.entries().get(id).and_then(|e| e.phase)
    }

    pub fn attempts(&self, id: &InstanceId) -> u64 {
        self.entries().get(id).map(|e| e.attempts).unwrap_or(0)
    }

    pub fn count_by_phase(&self) -> HashMap<Phase, usize> {
        let mut out = HashMap::new();
        for phase in self.entries().values().filter_map(|e| e.phase) {
            *out.entry(phase).or_insert(0) += 1;
        }
        out
    }

    pub fn active(&self) -> usize {
        self.entries().values().filter(|e| e.phase.is_some()).count()
    }

    /// Drop every entry and stop accepting updates.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.entries().drain().collect();
        for phase in drained.into_iter().filter_map(|(_, e)| e.phase) {
            self.active
                .add(-1, &[KeyValue::new("phase", phase.as_str())]);
        }
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
