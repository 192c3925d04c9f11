//! Journal records and snapshot reconstruction.
//!
//! Every write to a state store is one [`JournalRecord`]. A run's state is
//! never stored in place: [`RunSnapshot::replay`] folds the ordered records
//! into the run, its tasks, and their log entries. Replaying the same
//! records always yields the same snapshot.

use crate::core::{Run, RunId, RunStatus, StatusCounts, Task, TaskGraph, TaskId, TaskStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One committed task status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    /// Implementer output, error detail, or reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub at: DateTime<Utc>,
}

impl Transition {
    pub fn new(task_id: TaskId, from: TaskStatus, to: TaskStatus) -> Self {
        Self {
            task_id,
            from,
            to,
            payload: None,
            at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Write-once audit entry attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

/// A single persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalRecord {
    RunCreated {
        run: Run,
    },
    TasksRegistered {
        tasks: Vec<Task>,
    },
    RunStatusChanged {
        status: RunStatus,
        at: DateTime<Utc>,
    },
    Transition(Transition),
    Log {
        task_id: TaskId,
        entry: LogEntry,
    },
    /// A ticket the planner refused; it contributes no tasks.
    TicketRejected {
        ticket_id: String,
        reason: String,
    },
    /// Every task and rejection of the plan has been recorded.
    RunPlanned {
        at: DateTime<Utc>,
    },
    RunFinalized {
        status: RunStatus,
        at: DateTime<Utc>,
    },
}

/// Point-in-time state of a run rebuilt from its journal.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run: Run,
    /// Tasks in registration (declaration) order.
    pub tasks: Vec<Task>,
    pub logs: BTreeMap<TaskId, Vec<LogEntry>>,
    /// Rejected tickets with the planning error, in planning order.
    pub rejected: Vec<(String, String)>,
    /// Whether the plan was completely recorded. A run without it stopped
    /// mid-planning and has no trustworthy task set.
    pub planned: bool,
}

impl RunSnapshot {
    /// Rebuild a snapshot from ordered journal records.
    ///
    /// # Errors
    /// Returns [`Error::RunNotFound`] for an empty journal and
    /// [`Error::CorruptJournal`] if any record does not apply cleanly.
    pub fn replay(run_id: &RunId, records: &[JournalRecord]) -> Result<Self> {
        let corrupt = |record: usize, reason: String| Error::CorruptJournal {
            run_id: run_id.to_string(),
            record,
            reason,
        };

        let mut snapshot = match records.first() {
            Some(JournalRecord::RunCreated { run }) => Self {
                run: run.clone(),
                tasks: Vec::new(),
                logs: BTreeMap::new(),
                rejected: Vec::new(),
                planned: false,
            },
            Some(_) => {
                return Err(corrupt(
                    0,
                    "journal does not start with run creation".to_string(),
                ))
            }
            None => return Err(Error::RunNotFound(run_id.to_string())),
        };

        for (index, record) in records.iter().enumerate().skip(1) {
            snapshot
                .apply(record)
                .map_err(|reason| corrupt(index, reason))?;
        }
        Ok(snapshot)
    }

    /// Apply one record on top of the snapshot.
    pub fn apply(&mut self, record: &JournalRecord) -> std::result::Result<(), String> {
        match record {
            JournalRecord::RunCreated { .. } => Err("run created twice".to_string()),
            JournalRecord::TasksRegistered { tasks } => {
                if self.planned {
                    return Err("tasks registered after the plan was closed".to_string());
                }
                for task in tasks {
                    if self.task(&task.id).is_some() {
                        return Err(format!("task {} registered twice", task.id));
                    }
                    self.tasks.push(task.clone());
                }
                Ok(())
            }
            JournalRecord::RunStatusChanged { status, .. } => {
                self.run.set_status(*status).map_err(|e| e.to_string())
            }
            JournalRecord::Transition(transition) => {
                let task = self
                    .tasks
                    .iter_mut()
                    .find(|t| t.id == transition.task_id)
                    .ok_or_else(|| format!("unknown task {}", transition.task_id))?;
                if task.status != transition.from {
                    return Err(format!(
                        "task {} is {} but transition starts from {}",
                        task.id, task.status, transition.from
                    ));
                }
                task.apply(transition.to, transition.payload.as_deref(), transition.at)
                    .map_err(|e| e.to_string())
            }
            JournalRecord::Log { task_id, entry } => {
                if self.task(task_id).is_none() {
                    return Err(format!("log entry for unknown task {}", task_id));
                }
                self.logs
                    .entry(task_id.clone())
                    .or_default()
                    .push(entry.clone());
                Ok(())
            }
            JournalRecord::TicketRejected { ticket_id, reason } => {
                self.rejected.push((ticket_id.clone(), reason.clone()));
                Ok(())
            }
            JournalRecord::RunPlanned { .. } => {
                if self.planned {
                    return Err("run planned twice".to_string());
                }
                self.planned = true;
                Ok(())
            }
            JournalRecord::RunFinalized { status, at } => {
                self.run.finalize(*status, *at).map_err(|e| e.to_string())
            }
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn logs_for(&self, id: &TaskId) -> &[LogEntry] {
        self.logs.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Rebuild the in-memory task graph with every task's persisted status.
    pub fn graph(&self) -> Result<TaskGraph> {
        Ok(TaskGraph::from_tasks(self.tasks.clone())?)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            counts.record(task.status);
        }
        counts
    }
}
