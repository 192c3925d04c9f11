//! Scheduling correctness tests.
//!
//! These tests verify the concurrency budget, dependency ordering, retry
//! policy and skip propagation of the scheduler.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use ground_control::core::{TaskId, TaskStatus};
use ground_control::orchestration::{ScheduleOutcome, Scheduler, SchedulerEvent};
use ground_control::state::StateStore;

use crate::fixtures::{config, diamond, independent_tasks, task, Behavior, Harness};

/// Test: Concurrency budget
/// Given 8 independent tasks and a budget of 3
/// When the scheduler runs
/// Then never more than 3 run at once, and all succeed
#[tokio::test]
async fn test_running_never_exceeds_budget() {
    let harness = Harness::with_delay(Duration::from_millis(20));
    let tasks = independent_tasks(8);
    let run_id = harness.seed_run("run-budget", &tasks).await;
    let graph = harness.store.load_run(&run_id).await.unwrap().graph().unwrap();

    let report = Scheduler::new(
        run_id,
        graph,
        harness.store.clone(),
        harness.dispatcher(),
        config(3),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.outcome, ScheduleOutcome::Completed);
    assert_eq!(report.counts.succeeded, 8);
    assert!(
        harness.implementer.peak() <= 3,
        "peak concurrency {} exceeded budget",
        harness.implementer.peak()
    );
    assert!(harness.implementer.peak() >= 2, "tasks should overlap");
}

/// Test: Budget is also respected through the event stream
/// Given 5 independent tasks and a budget of 2
/// When the scheduler runs
/// Then started-minus-finished never exceeds 2
#[tokio::test]
async fn test_event_stream_respects_budget() {
    let harness = Harness::with_delay(Duration::from_millis(10));
    let tasks = independent_tasks(5);
    let run_id = harness.seed_run("run-events", &tasks).await;
    let graph = harness.store.load_run(&run_id).await.unwrap().graph().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    Scheduler::new(run_id, graph, harness.store.clone(), harness.dispatcher(), config(2))
        .with_events(tx)
        .run()
        .await
        .unwrap();

    let mut in_flight: i32 = 0;
    let mut peak = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            SchedulerEvent::TaskStarted { .. } => in_flight += 1,
            SchedulerEvent::TaskSucceeded { .. } => in_flight -= 1,
            _ => {}
        }
        peak = peak.max(in_flight);
    }
    assert_eq!(in_flight, 0);
    assert!(peak <= 2);
}

/// Test: Declaration order among ready tasks
/// Given A, B (no deps) and C (deps A, B) with a budget of 1
/// When the scheduler runs
/// Then execution order is A, B, C and C starts after both succeeded
#[tokio::test]
async fn test_declaration_order_with_budget_of_one() {
    let harness = Harness::new();
    let tasks = vec![task("A", &[]), task("B", &[]), task("C", &["A", "B"])];
    let run_id = harness.seed_run("run-abc", &tasks).await;
    let graph = harness.store.load_run(&run_id).await.unwrap().graph().unwrap();

    let report = Scheduler::new(
        run_id.clone(),
        graph,
        harness.store.clone(),
        harness.dispatcher(),
        config(1),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(harness.implementer.started(), vec!["A", "B", "C"]);

    let get = |id: &str| report.graph.get(&TaskId::from(id)).unwrap().clone();
    let c_started = get("C").started_at.unwrap();
    assert!(get("A").finished_at.unwrap() <= c_started);
    assert!(get("B").finished_at.unwrap() <= c_started);
}

/// Test: Dependencies always succeed first
/// Given a diamond graph with a budget of 4
/// When the scheduler runs
/// Then every task starts only after its dependencies finished
#[tokio::test]
async fn test_dependencies_finish_before_dependents_start() {
    let harness = Harness::with_delay(Duration::from_millis(10));
    let run_id = harness.seed_run("run-diamond", &diamond()).await;
    let graph = harness.store.load_run(&run_id).await.unwrap().graph().unwrap();

    let report = Scheduler::new(run_id, graph, harness.store.clone(), harness.dispatcher(), config(4))
        .run()
        .await
        .unwrap();

    let started = harness.implementer.started();
    assert_eq!(started.first().map(String::as_str), Some("a"));
    assert_eq!(started.last().map(String::as_str), Some("d"));

    for task in report.graph.tasks() {
        let started_at = task.started_at.unwrap();
        for dep in report.graph.dependencies_of(&task.id) {
            assert_eq!(dep.status, TaskStatus::Succeeded);
            assert!(dep.finished_at.unwrap() <= started_at, "{} started before {}", task.id, dep.id);
        }
    }
}

/// Test: Skip propagation
/// Given a diamond where b fails semantically
/// When the scheduler runs
/// Then d is skipped, c still succeeds, and d never runs
#[tokio::test]
async fn test_failed_dependency_skips_dependents() {
    let harness = Harness::new();
    harness
        .implementer
        .script("b", Behavior::Fail("compilation failed".to_string()));
    let run_id = harness.seed_run("run-skip", &diamond()).await;
    let graph = harness.store.load_run(&run_id).await.unwrap().graph().unwrap();

    let report = Scheduler::new(
        run_id.clone(),
        graph,
        harness.store.clone(),
        harness.dispatcher(),
        config(2),
    )
    .run()
    .await
    .unwrap();

    let status: HashMap<&str, TaskStatus> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|id| (id, report.graph.get(&TaskId::from(id)).unwrap().status))
        .collect();
    assert_eq!(status["a"], TaskStatus::Succeeded);
    assert_eq!(status["b"], TaskStatus::Failed);
    assert_eq!(status["c"], TaskStatus::Succeeded);
    assert_eq!(status["d"], TaskStatus::Skipped);
    assert_eq!(harness.implementer.calls_for("d"), 0);
    assert_eq!(harness.implementer.calls_for("b"), 1, "semantic failures are not retried");

    // Persisted state agrees with memory.
    let snapshot = harness.store.load_run(&run_id).await.unwrap();
    assert_eq!(
        snapshot.task(&TaskId::from("d")).unwrap().status,
        TaskStatus::Skipped
    );
}

/// Test: Transient failures retry
/// Given a task that is rate limited twice
/// When the scheduler runs with 3 attempts
/// Then it succeeds on attempt 3 and its dependent runs
#[tokio::test]
async fn test_transient_failure_is_retried() {
    let harness = Harness::new();
    harness.implementer.script("A", Behavior::Flaky(2));
    let run_id = harness
        .seed_run("run-retry", &[task("A", &[]), task("B", &["A"])])
        .await;
    let graph = harness.store.load_run(&run_id).await.unwrap().graph().unwrap();

    let report = Scheduler::new(
        run_id.clone(),
        graph,
        harness.store.clone(),
        harness.dispatcher(),
        config(1),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.counts.succeeded, 2);
    assert_eq!(harness.implementer.calls_for("A"), 3);

    let snapshot = harness.store.load_run(&run_id).await.unwrap();
    let a = snapshot.task(&TaskId::from("A")).unwrap();
    assert_eq!(a.attempts, 3);
    let retries = snapshot
        .logs_for(&TaskId::from("A"))
        .iter()
        .filter(|entry| entry.message.contains("retrying"))
        .count();
    assert_eq!(retries, 2);
}

/// Test: Retry limit
/// Given a task that is always rate limited
/// When the scheduler runs with 3 attempts
/// Then it fails after exactly 3 attempts
#[tokio::test]
async fn test_retry_limit_fails_task() {
    let harness = Harness::new();
    harness.implementer.script("A", Behavior::Flaky(100));
    let run_id = harness.seed_run("run-limit", &[task("A", &[])]).await;
    let graph = harness.store.load_run(&run_id).await.unwrap().graph().unwrap();

    let report = Scheduler::new(run_id, graph, harness.store.clone(), harness.dispatcher(), config(1))
        .run()
        .await
        .unwrap();

    assert_eq!(report.counts.failed, 1);
    assert_eq!(harness.implementer.calls_for("A"), 3);
}
