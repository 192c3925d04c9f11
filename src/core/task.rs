//! Task and run data model.
//!
//! Tasks are the atomic units of work dispatched to agents. Each task
//! tracks its status, attempt count, result payload, and transition
//! timestamps. All status changes go through [`Task::apply`], which
//! enforces the task state machine.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for a task, unique within a run.
///
/// Planner-produced ids are namespaced by ticket (`<ticket>/<raw>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier for one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a fresh run id of the form `run-<12 hex chars>`.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("run-{}", &hex[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task status in its lifecycle.
///
/// `pending → ready → running → {succeeded, failed}`, with `skipped`
/// applied to tasks whose dependency closure failed and `interrupted`
/// marking a running task that was stopped before it committed a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting on dependencies.
    #[default]
    Pending,
    /// All dependencies succeeded; waiting for a free slot.
    Ready,
    /// Dispatched to an implementer.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully, no more attempts.
    Failed,
    /// Never run because a dependency failed or was skipped.
    Skipped,
    /// Stopped mid-flight without a committed result.
    Interrupted,
}

impl TaskStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Ready)
                | (Running, Interrupted)
                | (Interrupted, Ready)
        )
    }

    /// Succeeded, failed, or skipped.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Failed or skipped: dependents of such a task can never run.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single task in the run graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the run.
    pub id: TaskId,
    /// Ticket this task was decomposed from.
    pub ticket_id: String,
    /// Short human-readable title.
    pub title: String,
    /// Instructions handed to the implementer.
    pub description: String,
    /// Agent role that should execute the task.
    pub role: String,
    /// Tasks that must succeed first, in declaration order.
    pub dependencies: Vec<TaskId>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Number of times the task has been started.
    pub attempts: u32,
    /// Implementer output or error detail from the latest transition that carried one.
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with no dependencies.
    pub fn new(id: impl Into<TaskId>, ticket_id: &str, title: &str, role: &str) -> Self {
        Self {
            id: id.into(),
            ticket_id: ticket_id.to_string(),
            title: title.to_string(),
            description: String::new(),
            role: role.to_string(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            attempts: 0,
            result: None,
            created_at: Utc::now(),
            ready_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Apply a status transition.
    ///
    /// This is the only place task status changes. Starting a task
    /// increments its attempt count; a payload, when given, replaces
    /// the stored result.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTransition`] if the state machine forbids
    /// moving from the current status to `to`.
    pub fn apply(&mut self, to: TaskStatus, payload: Option<&str>, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                task: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        match to {
            TaskStatus::Ready => {
                self.ready_at = Some(at);
                self.finished_at = None;
            }
            TaskStatus::Running => {
                self.attempts += 1;
                self.started_at = Some(at);
            }
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped => {
                self.finished_at = Some(at);
            }
            TaskStatus::Interrupted | TaskStatus::Pending => {}
        }

        if let Some(payload) = payload {
            self.result = Some(payload.to_string());
        }
        self.status = to;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Status of a run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Partial
        )
    }

    /// Derive the terminal status from succeeded and unsuccessful counts.
    ///
    /// Nothing unsuccessful is `Succeeded` (including the empty run),
    /// nothing succeeded is `Failed`, and anything mixed is `Partial`.
    pub fn aggregate(succeeded: usize, unsuccessful: usize) -> Self {
        if unsuccessful == 0 {
            RunStatus::Succeeded
        } else if succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// One execution of the orchestrator against a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(id: RunId, project: &str) -> Self {
        Self {
            id,
            project: project.to_string(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Move the run to a non-terminal status.
    ///
    /// # Errors
    /// Returns [`Error::RunFinalized`] once the run is terminal.
    pub fn set_status(&mut self, status: RunStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::RunFinalized(self.id.to_string()));
        }
        self.status = status;
        Ok(())
    }

    /// Close the run with a terminal status.
    ///
    /// # Errors
    /// Returns [`Error::RunFinalized`] if the run was already closed and
    /// [`Error::Validation`] if `status` is not terminal.
    pub fn finalize(&mut self, status: RunStatus, at: DateTime<Utc>) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::Validation(format!(
                "cannot finalize run {} with non-terminal status {}",
                self.id, status
            )));
        }
        self.set_status(status)?;
        self.ended_at = Some(at);
        Ok(())
    }
}
