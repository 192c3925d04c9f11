//! Planning tests through full orchestrator runs.
//!
//! These tests verify that invalid decompositions are rejected before any
//! of their tasks become ready, and that valid tickets keep running.

use ground_control::core::{RunId, RunStatus, TaskId, TaskStatus, Ticket, TicketStatus};
use ground_control::orchestration::ProposedTask;
use ground_control::state::StateStore;

use crate::fixtures::{config, Harness, ScriptedReasoner};

fn cyclic() -> Vec<ProposedTask> {
    vec![
        ProposedTask::new("a", "a", "developer").with_dependencies(&["b"]),
        ProposedTask::new("b", "b", "developer").with_dependencies(&["a"]),
    ]
}

/// Test: Cyclic plan is rejected
/// Given T-1 with a valid plan and T-2 whose plan has A <-> B
/// When the run executes
/// Then T-2 contributes no tasks, T-1 completes, and the run is partial
#[tokio::test]
async fn test_cyclic_ticket_rejected_before_scheduling() {
    let harness = Harness::new();
    let reasoner = ScriptedReasoner::new().plan("T-2", cyclic());
    let orch = harness.orchestrator(
        vec![Ticket::new("T-1", "valid"), Ticket::new("T-2", "cyclic")],
        reasoner,
        config(2),
    );

    let summary = orch.run_with_id(RunId::from("run-cycle")).await.unwrap();

    assert_eq!(summary.status, RunStatus::Partial);
    assert_eq!(summary.rejected.len(), 1);
    assert_eq!(summary.rejected[0].0, "T-2");
    assert!(summary.rejected[0].1.to_lowercase().contains("cycle"));

    let snapshot = harness.store.load_run(&RunId::from("run-cycle")).await.unwrap();
    assert!(snapshot.tasks.iter().all(|t| t.ticket_id == "T-1"));
    assert!(snapshot.task(&TaskId::from("T-2/a")).is_none());
    assert_eq!(harness.implementer.calls_for("a"), 0);
    assert_eq!(snapshot.rejected.len(), 1);
}

/// Test: Unknown role and provider failure
/// Given one ticket assigning a role nobody plays and one whose reasoning fails
/// When the run executes
/// Then both are rejected and the run fails
#[tokio::test]
async fn test_unknown_role_and_provider_failure_rejected() {
    let harness = Harness::new();
    let reasoner = ScriptedReasoner::new()
        .plan("T-1", vec![ProposedTask::new("x", "x", "astronaut")])
        .fail("T-2", "upstream returned garbage");
    let orch = harness.orchestrator(
        vec![Ticket::new("T-1", "role"), Ticket::new("T-2", "provider")],
        reasoner,
        config(2),
    );

    let summary = orch.run_with_id(RunId::from("run-reject")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    let rejected: Vec<&str> = summary.rejected.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(rejected, vec!["T-1", "T-2"]);
    assert!(summary.rejected[0].1.contains("astronaut"));
    assert!(harness.implementer.started().is_empty());
}

/// Test: Cross-ticket dependency
/// Given T-2 depending on T-1, each with one task
/// When the run executes with a budget of 4
/// Then T-2's task starts only after T-1's task succeeded
#[tokio::test]
async fn test_ticket_dependency_orders_tasks() {
    let harness = Harness::new();
    let orch = harness.orchestrator(
        vec![
            Ticket::new("T-1", "base"),
            Ticket::new("T-2", "on top").with_dependencies(&["T-1"]),
        ],
        ScriptedReasoner::new(),
        config(4),
    );

    let summary = orch.run_with_id(RunId::from("run-linked")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(harness.implementer.started(), vec!["T-1", "T-2"]);

    let snapshot = harness.store.load_run(&RunId::from("run-linked")).await.unwrap();
    let downstream = snapshot.task(&TaskId::from("T-2/work")).unwrap();
    assert_eq!(downstream.dependencies, vec![TaskId::from("T-1/work")]);
}

/// Test: Dependency on a rejected ticket
/// Given T-1 with a cyclic plan and T-2 depending on T-1
/// When the run executes
/// Then both tickets are rejected and nothing runs
#[tokio::test]
async fn test_dependency_on_rejected_ticket_rejects_dependent() {
    let harness = Harness::new();
    let orch = harness.orchestrator(
        vec![
            Ticket::new("T-1", "cyclic"),
            Ticket::new("T-2", "after").with_dependencies(&["T-1"]),
        ],
        ScriptedReasoner::new().plan("T-1", cyclic()),
        config(2),
    );

    let summary = orch.run_with_id(RunId::from("run-chain")).await.unwrap();
    assert_eq!(summary.rejected.len(), 2);
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.counts.total(), 0);
}

/// Test: Only open tickets are planned
/// Given one open and one done ticket
/// When the run executes
/// Then only the open ticket produces tasks
#[tokio::test]
async fn test_closed_tickets_are_not_planned() {
    let harness = Harness::new();
    let mut done = Ticket::new("T-0", "already shipped");
    done.status = TicketStatus::Done;
    let orch = harness.orchestrator(
        vec![done, Ticket::new("T-1", "open")],
        ScriptedReasoner::new(),
        config(1),
    );

    let summary = orch.run_with_id(RunId::from("run-open")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.counts.total(), 1);

    let snapshot = harness.store.load_run(&RunId::from("run-open")).await.unwrap();
    assert!(snapshot
        .tasks
        .iter()
        .all(|t| t.ticket_id == "T-1" && t.status == TaskStatus::Succeeded));
}
