//! Top-level run driver.
//!
//! Pulls tickets, plans them into one run graph, hands the graph to the
//! [`Scheduler`], and closes the run with an aggregated status.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use super::planner::{ClaudeReasoner, Planner};
use super::scheduler::{ScheduleOutcome, Scheduler, SchedulerConfig, SchedulerEvent};
use crate::agent::AgentRegistry;
use crate::config::ProjectConfig;
use crate::core::{Run, RunId, RunStatus, StatusCounts, Task, TaskGraph};
use crate::error::{Error, Result};
use crate::state::StateStore;
use crate::tickets::{TicketSource, TomlTicketSource};

/// Outcome of one `run` or `resume` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    /// `Running` when cancellation stopped the run before it finished.
    pub status: RunStatus,
    pub counts: StatusCounts,
    /// Ticket id and planning error for each rejected ticket.
    pub rejected: Vec<(String, String)>,
}

impl RunSummary {
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

pub struct Orchestrator {
    project: String,
    store: Arc<dyn StateStore>,
    tickets: Arc<dyn TicketSource>,
    planner: Planner,
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Orchestrator {
    pub fn new(
        project: &str,
        store: Arc<dyn StateStore>,
        tickets: Arc<dyn TicketSource>,
        planner: Planner,
        dispatcher: Arc<Dispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            project: project.to_string(),
            store,
            tickets,
            planner,
            dispatcher,
            config,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Wire the production collaborators for a loaded project: TOML
    /// tickets, Claude-backed planning, and the project's implementers.
    pub fn for_project(
        project: &ProjectConfig,
        agents: Arc<AgentRegistry>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let tickets = Arc::new(TomlTicketSource::new(&project.tickets.path));
        let reasoner = ClaudeReasoner::for_project(project, Arc::clone(&agents));
        let dispatcher = Dispatcher::for_project(project, agents);
        Self::new(
            &project.name,
            store,
            tickets,
            Planner::new(Arc::new(reasoner)),
            Arc::new(dispatcher),
            SchedulerConfig::from_settings(&project.settings),
        )
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a new run under a generated id.
    pub async fn run(&self) -> Result<RunSummary> {
        self.run_with_id(RunId::generate()).await
    }

    /// Start a new run.
    ///
    /// Tickets are listed and planned before the run is created, so a
    /// broken ticket source leaves no run behind. The plan is then written
    /// and closed with a planned marker before anything is scheduled.
    /// Rejected tickets are recorded and counted against the final status
    /// but never stop the run.
    ///
    /// # Errors
    /// Ticket source failures, and any state store failure, which is fatal.
    pub async fn run_with_id(&self, run_id: RunId) -> Result<RunSummary> {
        let tickets = self.tickets.list_tickets(&self.project).await?;
        let roles = self.dispatcher.agents().roles();
        let plan = self.planner.plan_run(&tickets, &roles).await;

        let run = Run::new(run_id.clone(), &self.project);
        self.store.create_run(&run).await?;
        self.store
            .update_run_status(&run_id, RunStatus::Running)
            .await?;
        info!(run_id = %run_id, project = %self.project, tickets = tickets.len(), "run started");

        let mut rejected = Vec::with_capacity(plan.rejected.len());
        for rejection in &plan.rejected {
            let reason = rejection.error.to_string();
            self.store
                .record_rejection(&run_id, &rejection.ticket_id, &reason)
                .await?;
            rejected.push((rejection.ticket_id.clone(), reason));
        }

        let tasks: Vec<Task> = plan.graph.tasks().cloned().collect();
        self.store.register_tasks(&run_id, &tasks).await?;
        self.store.mark_planned(&run_id).await?;
        info!(
            run_id = %run_id,
            planned = plan.planned.len(),
            rejected = rejected.len(),
            tasks = tasks.len(),
            "run planned"
        );

        self.drive(run_id, plan.graph, rejected).await
    }

    /// Continue a run from its persisted state.
    ///
    /// Tasks the previous process left running are interrupted and
    /// re-queued; succeeded tasks are never dispatched again.
    ///
    /// # Errors
    /// [`Error::RunFinalized`] for a closed run, [`Error::Validation`] if the
    /// run belongs to another project or stopped before its plan was
    /// recorded.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunSummary> {
        let snapshot = self.store.load_run(run_id).await?;
        if snapshot.run.status.is_terminal() {
            return Err(Error::RunFinalized(run_id.to_string()));
        }
        if snapshot.run.project != self.project {
            return Err(Error::Validation(format!(
                "run {} belongs to project {}, not {}",
                run_id, snapshot.run.project, self.project
            )));
        }
        if !snapshot.planned {
            return Err(Error::Validation(format!(
                "run {} stopped before its plan was recorded; start a new run",
                run_id
            )));
        }
        if snapshot.run.status == RunStatus::Pending {
            self.store
                .update_run_status(run_id, RunStatus::Running)
                .await?;
        }

        let counts = snapshot.counts();
        info!(
            run_id = %run_id,
            succeeded = counts.succeeded,
            outstanding = counts.outstanding(),
            "resuming run"
        );
        let graph = snapshot.graph()?;
        self.drive(run_id.clone(), graph, snapshot.rejected).await
    }

    async fn drive(
        &self,
        run_id: RunId,
        graph: TaskGraph,
        rejected: Vec<(String, String)>,
    ) -> Result<RunSummary> {
        let mut scheduler = Scheduler::new(
            run_id.clone(),
            graph,
            Arc::clone(&self.store),
            Arc::clone(&self.dispatcher),
            self.config.clone(),
        )
        .with_cancellation(self.cancel.clone());
        if let Some(events) = &self.events {
            scheduler = scheduler.with_events(events.clone());
        }
        let report = scheduler.run().await?;

        if report.outcome == ScheduleOutcome::Cancelled {
            warn!(
                run_id = %run_id,
                outstanding = report.counts.outstanding(),
                "run cancelled; resume to finish"
            );
            return Ok(RunSummary {
                run_id,
                status: RunStatus::Running,
                counts: report.counts,
                rejected,
            });
        }

        let status = RunStatus::aggregate(
            report.counts.succeeded,
            report.counts.unsuccessful() + rejected.len(),
        );
        self.store.finalize_run(&run_id, status).await?;
        info!(run_id = %run_id, %status, "run finished");

        Ok(RunSummary {
            run_id,
            status,
            counts: report.counts,
            rejected,
        })
    }
}
