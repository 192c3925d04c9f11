use thiserror::Error;

/// Reasons a ticket fails to plan.
///
/// Any of these rejects the whole ticket: no task from it is scheduled,
/// and the run carries on with the remaining tickets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("Reasoning provider failed for ticket {ticket}: {reason}")]
    Provider { ticket: String, reason: String },

    #[error("Ticket {ticket} decomposed into no tasks")]
    EmptyPlan { ticket: String },

    #[error("Task {task} targets unknown agent role '{role}'")]
    UnknownRole { task: String, role: String },

    #[error("Task {task} depends on itself")]
    SelfDependency { task: String },

    #[error("Task {task} depends on {dependency}, which is not part of the same plan")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task id {task} is declared more than once")]
    DuplicateTask { task: String },

    #[error("Dependency cycle among tasks: {}", tasks.join(", "))]
    Cycle { tasks: Vec<String> },

    #[error("Ticket {ticket} depends on ticket {dependency}, which could not be planned")]
    TicketDependencyRejected { ticket: String, dependency: String },

    #[error("Ticket {ticket} depends on ticket {dependency}, which is declared after it")]
    ForwardTicketDependency { ticket: String, dependency: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("State store failed to commit for run {run_id}: {reason}")]
    Persistence { run_id: String, reason: String },

    #[error("Journal for run {run_id} is corrupt at record {record}: {reason}")]
    CorruptJournal {
        run_id: String,
        record: usize,
        reason: String,
    },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already exists: {0}")]
    RunExists(String),

    #[error("Run {0} is already finalized")]
    RunFinalized(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Build a persistence error for the given run.
    pub fn persistence(run_id: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Self::Persistence {
            run_id: run_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must abort the scheduling loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Persistence { .. } | Error::CorruptJournal { .. } | Error::RunFinalized(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
