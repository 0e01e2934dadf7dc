use baton_core::{
    ArtifactRef, BatonError, BatonResult, FailureReason, Task, TaskError, TaskState,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// One accepted state change, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Task the change applies to.
    pub task_id: Uuid,
    /// 1-based position in the task's history.
    pub seq: u32,
    /// State before the change.
    pub from: TaskState,
    /// State after the change.
    pub to: TaskState,
    /// Set for changes made through [`TaskLedger::force_fail`].
    pub forced: bool,
    /// Failure classification when `to` is `failed`.
    pub reason: Option<FailureReason>,
    /// When the change was applied.
    pub at: DateTime<Utc>,
}

/// Data merged into the task together with a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionPayload {
    /// Result payload to store.
    pub result: Option<serde_json::Value>,
    /// Error payload; required when moving to `failed`.
    pub error: Option<TaskError>,
    /// Artifact references to append.
    pub artifacts: Vec<ArtifactRef>,
    /// External protocol id to record.
    pub external_id: Option<String>,
}

impl TransitionPayload {
    /// Empty payload.
    pub fn none() -> Self {
        Self::default()
    }

    /// Payload carrying only an error.
    pub fn failure(error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Payload carrying a result and artifacts.
    pub fn produced(result: Option<serde_json::Value>, artifacts: Vec<ArtifactRef>) -> Self {
        Self {
            result,
            artifacts,
            ..Self::default()
        }
    }

    /// Sets the external id.
    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }
}

/// Query over current (non-archived) tasks. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Any of these states.
    #[serde(default)]
    pub states: Vec<TaskState>,
    /// Target agent.
    pub to_agent: Option<String>,
    /// Originating agent.
    pub from_agent: Option<String>,
    /// Task type tag.
    pub task_type: Option<String>,
    /// Session id.
    pub session_id: Option<Uuid>,
    /// Created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Deadline strictly before this instant.
    pub deadline_before: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Filter on a set of states.
    pub fn in_states(states: impl IntoIterator<Item = TaskState>) -> Self {
        Self {
            states: states.into_iter().collect(),
            ..Self::default()
        }
    }

    fn matches(&self, task: &Task) -> bool {
        (self.states.is_empty() || self.states.contains(&task.state))
            && self.to_agent.as_ref().map_or(true, |a| *a == task.to_agent)
            && self.from_agent.as_ref().map_or(true, |a| *a == task.from_agent)
            && self.task_type.as_ref().map_or(true, |t| *t == task.task_type)
            && self.session_id.map_or(true, |s| s == task.session_id)
            && self.created_before.map_or(true, |t| task.created_at < t)
            && self.deadline_before.map_or(true, |t| task.deadline < t)
    }
}

struct TaskSlot {
    snapshot: RwLock<Arc<Task>>,
    /// Held for the whole read-validate-apply sequence; owns the history.
    writer: Mutex<Vec<TransitionRecord>>,
}

struct ArchivedTask {
    task: Arc<Task>,
    history: Vec<TransitionRecord>,
}

/// The authoritative store of tasks and their lifecycle.
///
/// Each task has exactly one writer at a time. Readers take a cloned
/// `Arc<Task>` snapshot and are never blocked by a writer's validation.
pub struct TaskLedger {
    slots: DashMap<Uuid, Arc<TaskSlot>>,
    archive: DashMap<Uuid, ArchivedTask>,
    events: broadcast::Sender<TransitionRecord>,
}

impl TaskLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            slots: DashMap::new(),
            archive: DashMap::new(),
            events,
        }
    }

    /// Inserts a new task in `pending` and returns its id.
    pub fn create(&self, task: Task) -> BatonResult<Uuid> {
        if task.state != TaskState::Pending {
            return Err(BatonError::Protocol(format!(
                "task {} must be created in pending, got {}",
                task.id, task.state
            )));
        }
        let id = task.id;
        if self.archive.contains_key(&id) {
            return Err(BatonError::Protocol(format!("task {id} already exists")));
        }
        let Entry::Vacant(vacant) = self.slots.entry(id) else {
            return Err(BatonError::Protocol(format!("task {id} already exists")));
        };

        info!(
            task_id = %id,
            to_agent = %task.to_agent,
            task_type = %task.task_type,
            priority = %task.priority,
            protocol = %task.protocol,
            "Ledger: task created"
        );
        vacant.insert(Arc::new(TaskSlot {
            snapshot: RwLock::new(Arc::new(task)),
            writer: Mutex::new(Vec::new()),
        }));
        Ok(id)
    }

    /// Applies `from -> to` if `to` is in the lifecycle table for `from` and
    /// the task is currently in `from`.
    pub fn transition(
        &self,
        id: Uuid,
        from: TaskState,
        to: TaskState,
        payload: TransitionPayload,
    ) -> BatonResult<Arc<Task>> {
        if to == TaskState::Failed && payload.error.as_ref().map_or(true, TaskError::is_empty) {
            return Err(BatonError::Protocol(format!(
                "transition of task {id} to failed requires an error payload"
            )));
        }
        let reason = payload.error.as_ref().map(|e| e.reason);
        self.apply(id, from, to, payload, false, reason)
    }

    /// Fails a non-terminal task regardless of the lifecycle table.
    ///
    /// Only reasons accepted by [`FailureReason::may_force`] are allowed.
    pub fn force_fail(
        &self,
        id: Uuid,
        from: TaskState,
        error: TaskError,
    ) -> BatonResult<Arc<Task>> {
        if !error.reason.may_force() {
            return Err(BatonError::Protocol(format!(
                "reason {} cannot force-fail task {id}",
                error.reason
            )));
        }
        if error.is_empty() {
            return Err(BatonError::Protocol(format!(
                "forced failure of task {id} requires an error message"
            )));
        }
        let reason = Some(error.reason);
        self.apply(
            id,
            from,
            TaskState::Failed,
            TransitionPayload::failure(error),
            true,
            reason,
        )
    }

    fn apply(
        &self,
        id: Uuid,
        from: TaskState,
        to: TaskState,
        payload: TransitionPayload,
        forced: bool,
        reason: Option<FailureReason>,
    ) -> BatonResult<Arc<Task>> {
        let slot = self.slot(id)?;
        let mut history = slot.writer.lock();
        let current = slot.snapshot.read().clone();

        let allowed = if forced {
            !current.state.is_terminal()
        } else {
            from.can_transition_to(to)
        };
        if current.state != from || !allowed {
            debug!(
                task_id = %id,
                from = %from,
                to = %to,
                current = %current.state,
                forced,
                "Ledger: transition rejected"
            );
            return Err(BatonError::InvalidTransition {
                task_id: id,
                from,
                to,
                current: current.state,
            });
        }

        let now = Utc::now();
        let mut next = (*current).clone();
        next.state = to;
        next.updated_at = now;
        if let Some(result) = payload.result {
            next.result = Some(result);
        }
        if let Some(error) = payload.error {
            next.error = Some(error);
        }
        next.artifacts.extend(payload.artifacts);
        if let Some(external_id) = payload.external_id {
            next.external_id = Some(external_id);
        }

        let record = TransitionRecord {
            task_id: id,
            seq: history.len() as u32 + 1,
            from,
            to,
            forced,
            reason,
            at: now,
        };
        history.push(record.clone());

        let next = Arc::new(next);
        *slot.snapshot.write() = next.clone();
        drop(history);

        if forced {
            warn!(task_id = %id, from = %from, reason = ?reason, "Ledger: task force-failed");
        } else {
            info!(task_id = %id, from = %from, to = %to, "Ledger: transition applied");
        }
        let _ = self.events.send(record);
        Ok(next)
    }

    /// Records an external protocol id without changing state.
    pub fn set_external_id(&self, id: Uuid, external_id: impl Into<String>) -> BatonResult<()> {
        let slot = self.slot(id)?;
        let _writer = slot.writer.lock();
        let mut next = (**slot.snapshot.read()).clone();
        next.external_id = Some(external_id.into());
        *slot.snapshot.write() = Arc::new(next);
        Ok(())
    }

    /// Current snapshot of a task, falling back to the archive.
    pub fn get(&self, id: Uuid) -> BatonResult<Arc<Task>> {
        if let Some(slot) = self.slots.get(&id) {
            return Ok(slot.snapshot.read().clone());
        }
        self.get_archived(id)
    }

    /// Snapshot of an archived task.
    pub fn get_archived(&self, id: Uuid) -> BatonResult<Arc<Task>> {
        self.archive
            .get(&id)
            .map(|a| a.task.clone())
            .ok_or(BatonError::TaskNotFound(id))
    }

    /// Ordered transition history of a live or archived task.
    pub fn history(&self, id: Uuid) -> BatonResult<Vec<TransitionRecord>> {
        if let Some(slot) = self.slots.get(&id) {
            return Ok(slot.writer.lock().clone());
        }
        self.archive
            .get(&id)
            .map(|a| a.history.clone())
            .ok_or(BatonError::TaskNotFound(id))
    }

    /// Live tasks matching `filter`, oldest first.
    pub fn query(&self, filter: &TaskFilter) -> Vec<Arc<Task>> {
        let mut tasks: Vec<Arc<Task>> = self
            .slots
            .iter()
            .map(|entry| entry.snapshot.read().clone())
            .filter(|task| filter.matches(task))
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    /// Moves terminal tasks last updated more than `retention` ago into the
    /// archive. Returns the number archived.
    pub fn archive_terminal(&self, retention: Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let candidates: Vec<Uuid> = self
            .slots
            .iter()
            .filter(|entry| {
                let task = entry.snapshot.read();
                task.state.is_terminal() && task.updated_at < cutoff
            })
            .map(|entry| *entry.key())
            .collect();

        let mut archived = 0;
        for id in candidates {
            if let Some((_, slot)) = self.slots.remove(&id) {
                let history = slot.writer.lock().clone();
                let task = slot.snapshot.read().clone();
                self.archive.insert(id, ArchivedTask { task, history });
                archived += 1;
            }
        }
        if archived > 0 {
            info!(archived, "Ledger: terminal tasks archived");
        }
        archived
    }

    /// Subscribes to accepted transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionRecord> {
        self.events.subscribe()
    }

    /// Live task counts keyed by state name. Every state is present.
    pub fn counts_by_state(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = TaskState::ALL
            .into_iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for entry in &self.slots {
            let state = entry.snapshot.read().state;
            *counts.entry(state.as_str().to_string()).or_default() += 1;
        }
        counts
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the ledger holds no live tasks.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of archived tasks.
    pub fn archived_len(&self) -> usize {
        self.archive.len()
    }

    fn slot(&self, id: Uuid) -> BatonResult<Arc<TaskSlot>> {
        if let Some(slot) = self.slots.get(&id) {
            return Ok(Arc::clone(slot.value()));
        }
        if let Some(archived) = self.archive.get(&id) {
            return Err(BatonError::InvalidTransition {
                task_id: id,
                from: archived.task.state,
                to: archived.task.state,
                current: archived.task.state,
            });
        }
        Err(BatonError::TaskNotFound(id))
    }
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use baton_core::ProtocolBinding;

    fn new_task() -> Task {
        Task::new(
            Uuid::new_v4(),
            "planner",
            "coder",
            "implement",
            ProtocolBinding::Internal,
            Duration::minutes(5),
        )
    }

    fn drive_to_in_progress(ledger: &TaskLedger, id: Uuid) {
        ledger
            .transition(id, TaskState::Pending, TaskState::Accepted, TransitionPayload::none())
            .unwrap();
        ledger
            .transition(
                id,
                TaskState::Accepted,
                TaskState::InProgress,
                TransitionPayload::none(),
            )
            .unwrap();
    }

    #[test]
    fn test_happy_path_records_history() {
        let ledger = TaskLedger::new();
        let id = ledger.create(new_task()).unwrap();
        drive_to_in_progress(&ledger, id);
        let task = ledger
            .transition(
                id,
                TaskState::InProgress,
                TaskState::Completed,
                TransitionPayload::produced(Some(serde_json::json!({"ok": true})), vec![]),
            )
            .unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result.as_ref().unwrap()["ok"], true);

        let history = ledger.history(id).unwrap();
        let steps: Vec<_> = history.iter().map(|r| (r.from, r.to)).collect();
        assert_eq!(
            steps,
            vec![
                (TaskState::Pending, TaskState::Accepted),
                (TaskState::Accepted, TaskState::InProgress),
                (TaskState::InProgress, TaskState::Completed),
            ]
        );
        assert_eq!(history.last().unwrap().seq, 3);
    }

    #[test]
    fn test_pending_to_completed_rejected_without_change() {
        let ledger = TaskLedger::new();
        let id = ledger.create(new_task()).unwrap();
        let err = ledger
            .transition(id, TaskState::Pending, TaskState::Completed, TransitionPayload::none())
            .unwrap_err();
        assert!(matches!(err, BatonError::InvalidTransition { .. }));
        assert_eq!(ledger.get(id).unwrap().state, TaskState::Pending);
        assert!(ledger.history(id).unwrap().is_empty());
    }

    #[test]
    fn test_stale_from_is_rejected() {
        let ledger = TaskLedger::new();
        let id = ledger.create(new_task()).unwrap();
        ledger
            .transition(id, TaskState::Pending, TaskState::Accepted, TransitionPayload::none())
            .unwrap();
        let err = ledger
            .transition(id, TaskState::Pending, TaskState::Cancelled, TransitionPayload::none())
            .unwrap_err();
        match err {
            BatonError::InvalidTransition { current, .. } => {
                assert_eq!(current, TaskState::Accepted)
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_failed_requires_error_payload() {
        let ledger = TaskLedger::new();
        let id = ledger.create(new_task()).unwrap();
        drive_to_in_progress(&ledger, id);
        let err = ledger
            .transition(id, TaskState::InProgress, TaskState::Failed, TransitionPayload::none())
            .unwrap_err();
        assert!(matches!(err, BatonError::Protocol(_)));
        let task = ledger
            .transition(
                id,
                TaskState::InProgress,
                TaskState::Failed,
                TransitionPayload::failure(TaskError::new(
                    FailureReason::ExecutionError,
                    "worker crashed",
                )),
            )
            .unwrap();
        assert_eq!(task.error.as_ref().unwrap().reason, FailureReason::ExecutionError);
    }

    #[test]
    fn test_force_fail_from_pending_and_terminal_guard() {
        let ledger = TaskLedger::new();
        let id = ledger.create(new_task()).unwrap();
        let task = ledger
            .force_fail(
                id,
                TaskState::Pending,
                TaskError::new(FailureReason::Expired, "deadline passed"),
            )
            .unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert!(ledger.history(id).unwrap()[0].forced);

        let again = ledger.force_fail(
            id,
            TaskState::Failed,
            TaskError::new(FailureReason::Expired, "deadline passed"),
        );
        assert!(matches!(again, Err(BatonError::InvalidTransition { .. })));
    }

    #[test]
    fn test_force_fail_rejects_ordinary_reasons() {
        let ledger = TaskLedger::new();
        let id = ledger.create(new_task()).unwrap();
        let err = ledger
            .force_fail(
                id,
                TaskState::Pending,
                TaskError::new(FailureReason::AuditNoGo, "nope"),
            )
            .unwrap_err();
        assert!(matches!(err, BatonError::Protocol(_)));
    }

    #[test]
    fn test_query_filters_and_limits() {
        let ledger = TaskLedger::new();
        for _ in 0..3 {
            ledger.create(new_task()).unwrap();
        }
        let mut other = new_task();
        other.to_agent = "tester".into();
        let other_id = ledger.create(other).unwrap();
        ledger
            .transition(
                other_id,
                TaskState::Pending,
                TaskState::Cancelled,
                TransitionPayload::none(),
            )
            .unwrap();

        let pending = ledger.query(&TaskFilter::in_states([TaskState::Pending]));
        assert_eq!(pending.len(), 3);
        let tester = ledger.query(&TaskFilter {
            to_agent: Some("tester".into()),
            ..TaskFilter::default()
        });
        assert_eq!(tester.len(), 1);
        let limited = ledger.query(&TaskFilter {
            limit: Some(2),
            ..TaskFilter::default()
        });
        assert_eq!(limited.len(), 2);
        assert_eq!(ledger.counts_by_state()["cancelled"], 1);
    }

    #[test]
    fn test_archive_terminal_keeps_history_readable() {
        let ledger = TaskLedger::new();
        let id = ledger.create(new_task()).unwrap();
        let live = ledger.create(new_task()).unwrap();
        ledger
            .transition(id, TaskState::Pending, TaskState::Cancelled, TransitionPayload::none())
            .unwrap();

        assert_eq!(ledger.archive_terminal(Duration::seconds(-1)), 1);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get_archived(id).unwrap().state, TaskState::Cancelled);
        assert_eq!(ledger.get(id).unwrap().state, TaskState::Cancelled);
        assert_eq!(ledger.history(id).unwrap().len(), 1);
        assert!(ledger.get_archived(live).is_err());
        assert!(ledger
            .transition(id, TaskState::Cancelled, TaskState::Pending, TransitionPayload::none())
            .is_err());
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let ledger = TaskLedger::new();
        let mut rx = ledger.subscribe();
        let id = ledger.create(new_task()).unwrap();
        ledger
            .transition(id, TaskState::Pending, TaskState::Accepted, TransitionPayload::none())
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, id);
        assert_eq!(event.to, TaskState::Accepted);
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let ledger = TaskLedger::new();
        let task = new_task();
        ledger.create(task.clone()).unwrap();
        assert!(ledger.create(task).is_err());
    }

    #[test]
    fn test_concurrent_create_of_same_id_admits_one() {
        let ledger = TaskLedger::new();
        let task = new_task();
        let created: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| ledger.create(task.clone()).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(created, 1);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.history(task.id).unwrap().len(), 0);
    }
}
