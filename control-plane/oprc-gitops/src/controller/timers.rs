use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::crd::InstanceId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey {
    pub instance: InstanceId,
    pub sub: String,
}

impl TimerKey {
    pub fn new(instance: InstanceId, sub: impl Into<String>) -> Self {
        Self {
            instance,
            sub: sub.into(),
        }
    }
}

struct TimerEntry {
    token: CancellationToken,
    handle: JoinHandle<()>,
    due: DateTime<Utc>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<TimerKey, TimerEntry>,
    by_instance: HashMap<InstanceId, HashSet<String>>,
}

impl Table {
    fn remove(&mut self, key: &TimerKey) -> Option<TimerEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(subs) = self.by_instance.get_mut(&key.instance) {
            subs.remove(&key.sub);
            if subs.is_empty() {
                self.by_instance.remove(&key.instance);
            }
        }
        Some(entry)
    }
}

/// Deferred renewal tasks keyed by (instance, sub-key).
///
/// Each entry owns a cancellation token so the finalizer cascade can stop
/// every task belonging to an instance.
#[derive(Default)]
pub struct RenewalTimers {
    table: Mutex<Table>,
}

impl RenewalTimers {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `task` after `delay` unless cancelled first. Replaces any timer
    /// already registered under `key`. The task receives its own token.
    pub fn schedule<F, Fut>(&self, key: TimerKey, delay: Duration, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(None, key, delay, task);
    }

    /// Re-arm from inside a running task. Nothing is scheduled once
    /// `current` (the running task's token) has been cancelled, so a task
    /// racing `cancel_all` cannot resurrect its instance's timers.
    pub fn reschedule<F, Fut>(
        &self,
        current: &CancellationToken,
        key: TimerKey,
        delay: Duration,
        task: F,
    ) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(Some(current), key, delay, task)
    }

    fn insert<F, Fut>(
        &self,
        guard: Option<&CancellationToken>,
        key: TimerKey,
        delay: Duration,
        task: F,
    ) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // cancellation happens under the same lock
        let mut table = self.table();
        if guard.is_some_and(CancellationToken::is_cancelled) {
            debug!(instance = %key.instance, sub = %key.sub, "timer cancelled, not re-armed");
            return false;
        }
        let token = CancellationToken::new();
        let child = token.clone();
        let own = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(delay) => task(own).await,
            }
        });
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Some(old) = table.remove(&key) {
            old.token.cancel();
        }
        debug!(instance = %key.instance, sub = %key.sub, ?delay, "timer scheduled");
        table
            .by_instance
            .entry(key.instance.clone())
            .or_default()
            .insert(key.sub.clone());
        table.entries.insert(key, TimerEntry { token, handle, due });
        true
    }

    pub fn cancel(&self, key: &TimerKey) -> bool {
        match self.table().remove(key) {
            Some(entry) => {
                entry.token.cancel();
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer of `instance`. Safe to call repeatedly.
    pub fn cancel_all(&self, instance: &InstanceId) -> usize {
        let mut table = self.table();
        let subs = table.by_instance.remove(instance).unwrap_or_default();
        let mut cancelled = 0;
        for sub in subs {
            let key = TimerKey::new(instance.clone(), sub);
            if let Some(entry) = table.entries.remove(&key) {
                entry.token.cancel();
                entry.handle.abort();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Whether a live timer exists for `key`.
    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.table()
            .entries
            .get(key)
            .is_some_and(|e| !e.token.is_cancelled() && !e.handle.is_finished())
    }

    pub fn due(&self, key: &TimerKey) -> Option<DateTime<Utc>> {
        self.table().entries.get(key).map(|e| e.due)
    }

    pub fn keys_for(&self, instance: &InstanceId) -> Vec<TimerKey> {
        let mut keys: Vec<_> = self
            .table()
            .by_instance
            .get(instance)
            .map(|subs| {
                subs.iter()
                    .map(|s| TimerKey::new(instance.clone(), s.clone()))
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        let mut table = self.table();
        table.by_instance.clear();
        for (_, entry) in table.entries.drain() {
            entry.token.cancel();
            entry.handle.abort();
        }
    }
}
