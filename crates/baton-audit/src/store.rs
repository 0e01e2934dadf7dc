use crate::report::{AuditDecision, AuditResult, CautionDecision};
use baton_core::{BatonError, BatonResult};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    by_task: HashMap<Uuid, Vec<AuditResult>>,
    owner: HashMap<Uuid, Uuid>,
    decisions: HashMap<Uuid, CautionDecision>,
}

/// Append-only audit history, per task.
///
/// Results are never edited after `record`; an accept or reject of a
/// CAUTION result is kept as a separate [`CautionDecision`].
#[derive(Default)]
pub struct AuditResultStore {
    inner: RwLock<Inner>,
}

impl AuditResultStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a result. Recording the same audit id twice is an error.
    pub fn record(&self, result: AuditResult) -> BatonResult<()> {
        let mut inner = self.inner.write();
        if inner.owner.contains_key(&result.id) {
            return Err(BatonError::Protocol(format!(
                "audit {} is already recorded",
                result.id
            )));
        }
        inner.owner.insert(result.id, result.task_id);
        inner.by_task.entry(result.task_id).or_default().push(result);
        Ok(())
    }

    /// Result by audit id.
    pub fn get(&self, audit_id: Uuid) -> BatonResult<AuditResult> {
        let inner = self.inner.read();
        inner
            .owner
            .get(&audit_id)
            .and_then(|task_id| inner.by_task.get(task_id))
            .and_then(|results| results.iter().find(|r| r.id == audit_id))
            .cloned()
            .ok_or(BatonError::AuditNotFound(audit_id))
    }

    /// Every result for a task, oldest first.
    pub fn for_task(&self, task_id: Uuid) -> Vec<AuditResult> {
        self.inner
            .read()
            .by_task
            .get(&task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Most recent result for a task.
    pub fn latest(&self, task_id: Uuid) -> Option<AuditResult> {
        self.inner
            .read()
            .by_task
            .get(&task_id)
            .and_then(|results| results.last())
            .cloned()
    }

    /// Attempt number the next audit of `task_id` should carry.
    pub fn next_attempt(&self, task_id: Uuid) -> u32 {
        self.inner
            .read()
            .by_task
            .get(&task_id)
            .map_or(1, |results| results.len() as u32 + 1)
    }

    /// Records an accept or reject of a CAUTION result.
    ///
    /// Fails for results that are not CAUTION and for results that were
    /// already decided.
    pub fn decide_caution(
        &self,
        audit_id: Uuid,
        accept: bool,
        reviewer: &str,
    ) -> BatonResult<CautionDecision> {
        let mut inner = self.inner.write();
        let task_id = *inner
            .owner
            .get(&audit_id)
            .ok_or(BatonError::AuditNotFound(audit_id))?;
        let decision = inner
            .by_task
            .get(&task_id)
            .and_then(|results| results.iter().find(|r| r.id == audit_id))
            .map(|r| r.decision)
            .ok_or(BatonError::AuditNotFound(audit_id))?;
        if decision != AuditDecision::Caution {
            return Err(BatonError::Protocol(format!(
                "audit {audit_id} decided {decision}, only CAUTION results take a review"
            )));
        }
        if inner.decisions.contains_key(&audit_id) {
            return Err(BatonError::Protocol(format!(
                "audit {audit_id} has already been reviewed"
            )));
        }

        let record = CautionDecision {
            audit_id,
            task_id,
            accepted: accept,
            reviewer: reviewer.to_string(),
            decided_at: Utc::now(),
        };
        inner.decisions.insert(audit_id, record.clone());
        info!(%audit_id, %task_id, accepted = accept, reviewer, "AuditResultStore: caution decided");
        Ok(record)
    }

    /// Review recorded for a CAUTION result.
    pub fn caution_decision(&self, audit_id: Uuid) -> Option<CautionDecision> {
        self.inner.read().decisions.get(&audit_id).cloned()
    }

    /// Tasks whose latest result is an undecided CAUTION.
    pub fn pending_cautions(&self) -> Vec<AuditResult> {
        let inner = self.inner.read();
        let mut pending: Vec<AuditResult> = inner
            .by_task
            .values()
            .filter_map(|results| results.last())
            .filter(|r| r.decision == AuditDecision::Caution && !inner.decisions.contains_key(&r.id))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::report::{AuditStage, StageReport};

    fn result(task_id: Uuid, attempt: u32, decision: AuditDecision) -> AuditResult {
        AuditResult {
            id: Uuid::new_v4(),
            task_id,
            attempt,
            stages: AuditStage::ALL.iter().map(|s| StageReport::skipped(*s)).collect(),
            decision,
            findings: Vec::new(),
            escalation: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_history_is_append_only() {
        let store = AuditResultStore::new();
        let task = Uuid::new_v4();
        assert_eq!(store.next_attempt(task), 1);

        let first = result(task, 1, AuditDecision::NoGo);
        let second = result(task, 2, AuditDecision::Go);
        store.record(first.clone()).unwrap();
        store.record(second.clone()).unwrap();

        assert!(store.record(first.clone()).is_err());
        assert_eq!(store.for_task(task), vec![first.clone(), second.clone()]);
        assert_eq!(store.latest(task).unwrap().id, second.id);
        assert_eq!(store.get(first.id).unwrap(), first);
        assert_eq!(store.next_attempt(task), 3);
        assert!(store.for_task(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_caution_decided_once() {
        let store = AuditResultStore::new();
        let task = Uuid::new_v4();
        let caution = result(task, 1, AuditDecision::Caution);
        store.record(caution.clone()).unwrap();
        assert_eq!(store.pending_cautions().len(), 1);

        let decision = store.decide_caution(caution.id, false, "ops").unwrap();
        assert!(!decision.accepted);
        assert_eq!(decision.task_id, task);
        assert_eq!(store.caution_decision(caution.id), Some(decision));
        assert!(store.pending_cautions().is_empty());

        let again = store.decide_caution(caution.id, true, "ops").unwrap_err();
        assert_eq!(again.kind(), "protocol");
        // The recorded result itself is unchanged.
        assert_eq!(store.get(caution.id).unwrap(), caution);
    }

    #[test]
    fn test_only_caution_takes_a_review() {
        let store = AuditResultStore::new();
        let go = result(Uuid::new_v4(), 1, AuditDecision::Go);
        store.record(go.clone()).unwrap();
        assert!(matches!(
            store.decide_caution(go.id, true, "ops"),
            Err(BatonError::Protocol(_))
        ));
        assert!(matches!(
            store.decide_caution(Uuid::new_v4(), true, "ops"),
            Err(BatonError::AuditNotFound(_))
        ));
    }
}
