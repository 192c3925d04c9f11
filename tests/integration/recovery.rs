//! Recovery tests.
//!
//! These tests verify resume after an abnormal stop, journal replay,
//! fatal persistence failures, and cooperative cancellation.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use ground_control::core::{Run, RunId, RunStatus, TaskId, TaskStatus, Ticket};
use ground_control::orchestration::{Orchestrator, Planner, ProposedTask};
use ground_control::state::{MemoryStateStore, StateStore, Transition};
use ground_control::Error;

use crate::fixtures::{config, task, Behavior, Harness, ScriptedReasoner, StaticTickets};

/// Commit a chain of transitions for one task.
async fn advance(store: &dyn StateStore, run_id: &RunId, id: &str, path: &[TaskStatus]) {
    for pair in path.windows(2) {
        let transition = Transition::new(TaskId::from(id), pair[0], pair[1]);
        store.record_task_transition(run_id, &transition).await.unwrap();
    }
}

/// Test: Resume after a crash
/// Given A succeeded, B left running with no terminal transition, C ready
/// When the run is resumed in a new process
/// Then exactly B and C run, A is not dispatched again, and the run succeeds
#[tokio::test]
async fn test_resume_requeues_only_interrupted_work() {
    use TaskStatus::*;
    let mut harness = Harness::new();
    let run_id = harness
        .seed_run(
            "run-crash",
            &[task("A", &[]), task("B", &["A"]), task("C", &[])],
        )
        .await;
    let store = harness.store.clone();
    advance(store.as_ref(), &run_id, "A", &[Pending, Ready, Running, Succeeded]).await;
    advance(store.as_ref(), &run_id, "B", &[Pending, Ready, Running]).await;
    advance(store.as_ref(), &run_id, "C", &[Pending, Ready]).await;

    harness.restart();
    let orch = harness.orchestrator(Vec::new(), ScriptedReasoner::new(), config(2));
    let summary = orch.resume(&run_id).await.unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(harness.implementer.calls_for("A"), 0);
    assert_eq!(harness.implementer.calls_for("B"), 1);
    assert_eq!(harness.implementer.calls_for("C"), 1);

    let snapshot = harness.store.load_run(&run_id).await.unwrap();
    let b = snapshot.task(&TaskId::from("B")).unwrap();
    assert_eq!(b.status, Succeeded);
    assert_eq!(b.attempts, 2, "the interrupted attempt still counts");
    assert!(snapshot
        .logs_for(&TaskId::from("B"))
        .iter()
        .any(|entry| entry.message.contains("re-queued")));
    assert_eq!(snapshot.task(&TaskId::from("A")).unwrap().attempts, 1);
}

/// Test: Torn journal tail
/// Given a journal whose last record was only partly written
/// When the run is resumed
/// Then the partial record counts as never committed
#[tokio::test]
async fn test_resume_discards_torn_tail() {
    use TaskStatus::*;
    let mut harness = Harness::new();
    let run_id = harness.seed_run("run-torn", &[task("A", &[])]).await;
    advance(harness.store.as_ref(), &run_id, "A", &[Pending, Ready]).await;

    let path = harness.store.journal_path(&run_id);
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"kind":"transition","task_id":"A","fr"#).unwrap();
    drop(file);

    harness.restart();
    let snapshot = harness.store.load_run(&run_id).await.unwrap();
    assert_eq!(snapshot.task(&TaskId::from("A")).unwrap().status, Ready);

    let orch = harness.orchestrator(Vec::new(), ScriptedReasoner::new(), config(1));
    let summary = orch.resume(&run_id).await.unwrap();
    assert_eq!(summary.status, RunStatus::Succeeded);

    // The repaired journal replays cleanly in yet another process.
    harness.restart();
    let snapshot = harness.store.load_run(&run_id).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Succeeded);
}

/// Test: Replay idempotence
/// Given a finished run
/// When its journal is loaded repeatedly and by a fresh store
/// Then every reconstruction is identical
#[tokio::test]
async fn test_replay_is_idempotent() {
    let mut harness = Harness::new();
    harness.implementer.script("b", Behavior::Fail("nope".to_string()));
    let orch = harness.orchestrator(
        vec![Ticket::new("T-1", "first"), Ticket::new("T-2", "second")],
        ScriptedReasoner::new().plan(
            "T-1",
            vec![
                ProposedTask::new("a", "a", "developer"),
                ProposedTask::new("b", "b", "reviewer")
                    .with_dependencies(&["a"]),
            ],
        ),
        config(2),
    );
    let run_id = RunId::from("run-replay");
    orch.run_with_id(run_id.clone()).await.unwrap();

    let first = harness.store.load_run(&run_id).await.unwrap();
    let second = harness.store.load_run(&run_id).await.unwrap();
    harness.restart();
    let third = harness.store.load_run(&run_id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_eq!(first.run.status, RunStatus::Partial);
    assert_eq!(first.graph().unwrap().counts(), third.graph().unwrap().counts());
}

/// Test: Persistence failure is fatal
/// Given a store that rejects writes once a task has started
/// When the run executes
/// Then the run aborts with a fatal error and the store keeps the last commit
#[tokio::test]
async fn test_persistence_failure_aborts_run() {
    let harness = Harness::new();
    // create, running, register, planned, A ready, A running; the attempt
    // log fails.
    let store = Arc::new(MemoryStateStore::failing_after(6));
    let orch = Orchestrator::new(
        "demo",
        store.clone(),
        Arc::new(StaticTickets(vec![Ticket::new("T-1", "one")])),
        Planner::new(Arc::new(ScriptedReasoner::new())),
        harness.dispatcher(),
        config(1),
    );

    let err = orch
        .run_with_id(RunId::from("run-fatal"))
        .await
        .unwrap_err();
    assert!(err.is_fatal(), "unexpected error: {}", err);
    assert!(matches!(err, Error::Persistence { .. }));

    let snapshot = store.load_run(&RunId::from("run-fatal")).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Running);
    assert_eq!(
        snapshot.task(&TaskId::from("T-1/work")).unwrap().status,
        TaskStatus::Running
    );
    assert_eq!(store.write_count(), 6);
}

/// Test: Cooperative cancellation
/// Given a run with a hanging task and a quick task
/// When the run is cancelled after the hanging task started
/// Then the hanging task is recorded interrupted, the run stays running,
/// and a later resume finishes it without re-running the quick task
#[tokio::test]
async fn test_cancel_interrupts_then_resume_completes() {
    let harness = Harness::new();
    harness.implementer.script("slow", Behavior::Hang);
    let orch = harness.orchestrator(
        vec![Ticket::new("T-1", "one")],
        ScriptedReasoner::new().plan(
            "T-1",
            vec![
                ProposedTask::new("slow", "slow", "developer"),
                ProposedTask::new("quick", "quick", "developer"),
            ],
        ),
        config(2),
    );
    let cancel = orch.cancellation_token();
    let run_id = RunId::from("run-cancel");

    let handle = tokio::spawn({
        let run_id = run_id.clone();
        async move { orch.run_with_id(run_id).await }
    });
    while harness.implementer.calls_for("slow") == 0 || harness.implementer.finished().is_empty()
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancellation should finish within the grace period")
        .unwrap()
        .unwrap();
    assert_eq!(summary.status, RunStatus::Running);

    let snapshot = harness.store.load_run(&run_id).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Running);
    assert_eq!(
        snapshot.task(&TaskId::from("T-1/slow")).unwrap().status,
        TaskStatus::Interrupted
    );
    assert_eq!(
        snapshot.task(&TaskId::from("T-1/quick")).unwrap().status,
        TaskStatus::Succeeded
    );

    harness.implementer.script("slow", Behavior::Succeed);
    let resumed = harness
        .orchestrator(Vec::new(), ScriptedReasoner::new(), config(2))
        .resume(&run_id)
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Succeeded);
    assert_eq!(harness.implementer.calls_for("quick"), 1);
    assert_eq!(harness.implementer.calls_for("slow"), 2);
}

/// Test: Worker panic
/// Given a task whose implementer panics
/// When the run executes
/// Then the panic is retried as a transient failure and the task fails
#[tokio::test]
async fn test_worker_panic_fails_task_without_aborting_run() {
    let harness = Harness::new();
    harness.implementer.script("T-2", Behavior::Panic);
    let orch = harness.orchestrator(
        vec![Ticket::new("T-1", "fine"), Ticket::new("T-2", "broken")],
        ScriptedReasoner::new(),
        config(2),
    );

    let summary = orch.run_with_id(RunId::from("run-panic")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Partial);
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(harness.implementer.calls_for("T-2"), 3);
}

/// Test: Finalized runs are immutable
/// Given a finished run
/// When it is finalized or resumed again
/// Then both are refused
#[tokio::test]
async fn test_finished_run_cannot_change() {
    let harness = Harness::new();
    let orch = harness.orchestrator(vec![Ticket::new("T-1", "one")], ScriptedReasoner::new(), config(1));
    let run_id = RunId::from("run-final");
    orch.run_with_id(run_id.clone()).await.unwrap();

    assert!(matches!(
        harness.store.finalize_run(&run_id, RunStatus::Failed).await,
        Err(Error::RunFinalized(_))
    ));
    assert!(matches!(orch.resume(&run_id).await, Err(Error::RunFinalized(_))));
}

/// Test: Crash during planning
/// Given a run whose journal stops before the plan was closed
/// When the run is resumed
/// Then resume is refused, nothing is dispatched, and the run is not finalized
#[tokio::test]
async fn test_resume_refuses_run_without_recorded_plan() {
    let mut harness = Harness::new();
    let run = Run::new(RunId::from("run-half-planned"), "demo");
    harness.store.create_run(&run).await.unwrap();
    harness
        .store
        .update_run_status(&run.id, RunStatus::Running)
        .await
        .unwrap();

    harness.restart();
    let orch = harness.orchestrator(
        vec![Ticket::new("T-1", "one")],
        ScriptedReasoner::new(),
        config(1),
    );
    let err = orch.resume(&run.id).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "unexpected error: {}", err);
    assert!(harness.implementer.started().is_empty());

    let snapshot = harness.store.load_run(&run.id).await.unwrap();
    assert!(!snapshot.planned);
    assert_eq!(snapshot.run.status, RunStatus::Running);
}
