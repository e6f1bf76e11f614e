use std::collections::BTreeMap;

use chrono::Utc;

use crate::crd::Phase;
use crate::crd::PlatformStatus;
use crate::crd::platform::{Condition, ConditionStatus, ConditionType};

pub const CHECKSUM_CACHE_TLS: &str = "cacheTls";

/// Status computed at the end of a pass, before timestamps are stamped.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub phase: Phase,
    pub message: String,
    pub observed_generation: Option<i64>,
    pub checksums: BTreeMap<String, String>,
}

impl StatusUpdate {
    pub fn new(phase: Phase, message: impl Into<String>, observed_generation: Option<i64>) -> Self {
        Self {
            phase,
            message: message.into(),
            observed_generation,
            checksums: BTreeMap::new(),
        }
    }

    pub fn with_checksum(mut self, key: &str, value: Option<String>) -> Self {
        if let Some(v) = value {
            self.checksums.insert(key.to_string(), v);
        }
        self
    }

    fn condition(&self) -> (ConditionStatus, &'static str) {
        match self.phase {
            Phase::Available => (ConditionStatus::True, "ReconcileSuccess"),
            Phase::Failed => (ConditionStatus::False, "ReconcileError"),
            Phase::Pending | Phase::Unknown => (ConditionStatus::Unknown, "InProgress"),
        }
    }

    /// Whether writing this update would change anything a reader cares
    /// about. Timestamps are ignored.
    pub fn differs_from(&self, prev: Option<&PlatformStatus>) -> bool {
        let Some(prev) = prev else {
            return true;
        };
        let (status, reason) = self.condition();
        let prev_condition = prev
            .conditions
            .as_ref()
            .and_then(|c| c.iter().find(|c| c.type_ == ConditionType::Reconciled));
        prev.phase != Some(self.phase)
            || prev.message.as_deref() != Some(self.message.as_str())
            || prev.observed_generation != self.observed_generation
            || prev.checksums.clone().unwrap_or_default() != self.checksums
            || prev_condition.is_none_or(|c| {
                c.status != status || c.reason.as_deref() != Some(reason)
            })
    }

    /// Render the full status, carrying the condition transition time over
    /// when the condition status did not flip.
    pub fn render(&self, prev: Option<&PlatformStatus>) -> PlatformStatus {
        let now = Utc::now().to_rfc3339();
        let (status, reason) = self.condition();
        let transition = prev
            .and_then(|p| p.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == ConditionType::Reconciled))
            .filter(|c| c.status == status)
            .and_then(|c| c.last_transition_time.clone())
            .unwrap_or_else(|| now.clone());
        PlatformStatus {
            phase: Some(self.phase),
            message: Some(self.message.clone()),
            observed_generation: self.observed_generation,
            last_updated: Some(now),
            checksums: if self.checksums.is_empty() {
                None
            } else {
                Some(self.checksums.clone())
            },
            conditions: Some(vec![Condition {
                type_: ConditionType::Reconciled,
                status,
                reason: Some(reason.to_string()),
                message: Some(self.message.clone()),
                last_transition_time: Some(transition),
            }]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_status_is_not_rewritten() {
        let update = StatusUpdate::new(Phase::Available, "Reconciled", Some(3))
            .with_checksum(CHECKSUM_CACHE_TLS, Some("abc".into()));
        let written = update.render(None);
        assert!(!update.differs_from(Some(&written)));

        let later = StatusUpdate::new(Phase::Available, "Reconciled", Some(4))
            .with_checksum(CHECKSUM_CACHE_TLS, Some("abc".into()));
        assert!(later.differs_from(Some(&written)));
    }

    #[test]
    fn transition_time_survives_same_status() {
        let first = StatusUpdate::new(Phase::Failed, "boom", Some(1)).render(None);
        let mut prev = first.clone();
        if let Some(c) = prev.conditions.as_mut() {
            c[0].last_transition_time = Some("2020-01-01T00:00:00+00:00".into());
        }
        let next = StatusUpdate::new(Phase::Failed, "still boom", Some(1)).render(Some(&prev));
        assert_eq!(
            next.conditions.unwrap()[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00+00:00")
        );
        let ok = StatusUpdate::new(Phase::Available, "Reconciled", Some(1)).render(Some(&prev));
        assert_ne!(
            ok.conditions.unwrap()[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00+00:00")
        );
    }
}
