#![allow(clippy::unwrap_used, clippy::expect_used)]

use baton_core::{BatonError, FailureReason, ProtocolBinding, Task, TaskError, TaskState};
use baton_ledger::{TaskLedger, TransitionPayload};
use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

fn task() -> Task {
    Task::new(
        Uuid::new_v4(),
        "planner",
        "coder",
        "implement",
        ProtocolBinding::Internal,
        Duration::minutes(5),
    )
}

// ---------------------------------------------------------------------------
// 1. Racing writers: exactly one wins each edge
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_writers_apply_exactly_one_transition() {
    let ledger = Arc::new(TaskLedger::new());
    let id = ledger.create(task()).unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let to = if i % 2 == 0 {
                TaskState::Accepted
            } else {
                TaskState::Cancelled
            };
            ledger.transition(id, TaskState::Pending, to, TransitionPayload::none())
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(BatonError::InvalidTransition { .. }) => {}
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(ledger.history(id).unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// 2. Reaper and worker race on an in-progress task
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_force_fail_and_completion_are_mutually_exclusive() {
    for _ in 0..50 {
        let ledger = Arc::new(TaskLedger::new());
        let id = ledger.create(task()).unwrap();
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

        let l1 = ledger.clone();
        let complete = tokio::spawn(async move {
            l1.transition(
                id,
                TaskState::InProgress,
                TaskState::Completed,
                TransitionPayload::none(),
            )
        });
        let l2 = ledger.clone();
        let expire = tokio::spawn(async move {
            l2.force_fail(
                id,
                TaskState::InProgress,
                TaskError::new(FailureReason::Expired, "in-progress ceiling exceeded"),
            )
        });

        let a = complete.await.unwrap().is_ok();
        let b = expire.await.unwrap().is_ok();
        assert!(a ^ b, "exactly one writer must win");
        let final_state = ledger.get(id).unwrap().state;
        assert!(final_state.is_terminal());
        assert_eq!(ledger.history(id).unwrap().len(), 3);
    }
}

// ---------------------------------------------------------------------------
// 3. Snapshots are immutable views
// ---------------------------------------------------------------------------

#[test]
fn test_snapshot_does_not_change_after_transition() {
    let ledger = TaskLedger::new();
    let id = ledger.create(task()).unwrap();
    let before = ledger.get(id).unwrap();
    ledger
        .transition(id, TaskState::Pending, TaskState::Accepted, TransitionPayload::none())
        .unwrap();
    assert_eq!(before.state, TaskState::Pending);
    assert_eq!(ledger.get(id).unwrap().state, TaskState::Accepted);
}

// ---------------------------------------------------------------------------
// 4. Unknown ids
// ---------------------------------------------------------------------------

#[test]
fn test_unknown_task_is_not_found() {
    let ledger = TaskLedger::new();
    let id = Uuid::new_v4();
    assert!(matches!(ledger.get(id), Err(BatonError::TaskNotFound(_))));
    assert!(matches!(
        ledger.transition(id, TaskState::Pending, TaskState::Accepted, TransitionPayload::none()),
        Err(BatonError::TaskNotFound(_))
    ));
}
