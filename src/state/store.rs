//! The `StateStore` abstraction.
//!
//! Backends only provide durable append and ordered read of journal
//! records. Everything else (status guards, replay, listing) is shared
//! through the provided methods so every backend enforces the same rules.

use async_trait::async_trait;
use chrono::Utc;

use super::journal::{JournalRecord, LogEntry, RunSnapshot, Transition};
use crate::core::{Run, RunId, RunStatus, Task, TaskId};
use crate::error::{Error, Result};

/// Durable record of runs, tasks, transitions and logs.
///
/// A successful return from any write means the record survives a crash.
/// Writes to one run are serialized by the caller (the scheduler's
/// coordinating loop), so backends only need per-record atomicity.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Start a new journal for `run`.
    ///
    /// # Errors
    /// Returns [`Error::RunExists`] if a journal for the run id already exists.
    async fn create_run(&self, run: &Run) -> Result<()>;

    /// Durably append one record to an existing run's journal.
    async fn append(&self, run_id: &RunId, record: JournalRecord) -> Result<()>;

    /// All committed records for a run, in commit order.
    async fn records(&self, run_id: &RunId) -> Result<Vec<JournalRecord>>;

    /// Ids of every run the store knows about.
    async fn run_ids(&self) -> Result<Vec<RunId>>;

    async fn register_tasks(&self, run_id: &RunId, tasks: &[Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        self.append(
            run_id,
            JournalRecord::TasksRegistered {
                tasks: tasks.to_vec(),
            },
        )
        .await
    }

    /// Close the plan: every task and rejection of the run is recorded.
    async fn mark_planned(&self, run_id: &RunId) -> Result<()> {
        self.append(run_id, JournalRecord::RunPlanned { at: Utc::now() })
            .await
    }

    async fn update_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<()> {
        if status.is_terminal() {
            return self.finalize_run(run_id, status).await;
        }
        let snapshot = self.load_run(run_id).await?;
        if snapshot.run.status.is_terminal() {
            return Err(Error::RunFinalized(run_id.to_string()));
        }
        self.append(
            run_id,
            JournalRecord::RunStatusChanged {
                status,
                at: Utc::now(),
            },
        )
        .await
    }

    async fn record_task_transition(&self, run_id: &RunId, transition: &Transition) -> Result<()> {
        self.append(run_id, JournalRecord::Transition(transition.clone()))
            .await
    }

    async fn append_log(&self, run_id: &RunId, task_id: &TaskId, entry: &LogEntry) -> Result<()> {
        self.append(
            run_id,
            JournalRecord::Log {
                task_id: task_id.clone(),
                entry: entry.clone(),
            },
        )
        .await
    }

    async fn record_rejection(&self, run_id: &RunId, ticket_id: &str, reason: &str) -> Result<()> {
        self.append(
            run_id,
            JournalRecord::TicketRejected {
                ticket_id: ticket_id.to_string(),
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Rebuild the run from its journal.
    async fn load_run(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let records = self.records(run_id).await?;
        RunSnapshot::replay(run_id, &records)
    }

    /// Record the final status of a run. A finalized run is never written again.
    async fn finalize_run(&self, run_id: &RunId, status: RunStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::Validation(format!(
                "cannot finalize run {} as {}",
                run_id, status
            )));
        }
        let snapshot = self.load_run(run_id).await?;
        if snapshot.run.status.is_terminal() {
            return Err(Error::RunFinalized(run_id.to_string()));
        }
        self.append(
            run_id,
            JournalRecord::RunFinalized {
                status,
                at: Utc::now(),
            },
        )
        .await
    }

    /// Every known run, most recently started first.
    async fn list_runs(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        for run_id in self.run_ids().await? {
            match self.load_run(&run_id).await {
                Ok(snapshot) => runs.push(snapshot.run),
                Err(Error::RunNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(runs)
    }
}
