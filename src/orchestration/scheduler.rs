//! Bounded-concurrency task scheduler.
//!
//! One coordinating loop owns the [`TaskGraph`] and is the only place task
//! status changes. Workers run in a [`JoinSet`] of at most
//! `max_concurrency` futures; each one makes a single dispatcher call and
//! reports back when the loop joins it.
//!
//! Every transition is written to the [`StateStore`] before it is applied
//! in memory and before any dependent is re-evaluated. A store failure
//! aborts the loop; dropping the join set aborts the in-flight workers.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::{Dispatcher, FailureKind, TaskResult};
use crate::config::ProjectSettings;
use crate::core::{RunId, StatusCounts, Task, TaskGraph, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::state::{LogEntry, StateStore, Transition};
use crate::util::truncate;

/// Longest failure detail copied into a task's log entry.
const LOG_DETAIL_CHARS: usize = 500;

/// Events emitted as tasks move through their lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TaskReady {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
    },
    TaskSucceeded {
        task_id: TaskId,
    },
    /// A transient failure put the task back in the ready set.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        detail: String,
    },
    TaskFailed {
        task_id: TaskId,
        kind: FailureKind,
        detail: String,
    },
    TaskSkipped {
        task_id: TaskId,
        /// The failed or skipped dependency that blocked it.
        blocked_by: TaskId,
    },
    TaskInterrupted {
        task_id: TaskId,
    },
    AllTasksComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    /// Attempts allowed for transient failures before a task fails.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    /// How long in-flight tasks may keep running after cancellation.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_settings(&ProjectSettings::default())
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &ProjectSettings) -> Self {
        Self {
            max_concurrency: settings.max_parallel_agents,
            max_attempts: settings.max_attempts,
            retry_backoff: settings.retry_backoff(),
            shutdown_grace: settings.shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Every task reached succeeded, failed, or skipped.
    Completed,
    /// Cancellation stopped the run with work outstanding.
    Cancelled,
}

#[derive(Debug)]
pub struct ScheduleReport {
    pub outcome: ScheduleOutcome,
    pub counts: StatusCounts,
    pub graph: TaskGraph,
}

enum WorkerOutcome {
    Finished(TaskResult),
    Interrupted,
}

pub struct Scheduler {
    run_id: RunId,
    graph: TaskGraph,
    store: Arc<dyn StateStore>,
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    /// Ready tasks by declaration position; the lowest starts first.
    ready: BTreeSet<usize>,
    running: HashMap<tokio::task::Id, TaskId>,
}

impl Scheduler {
    pub fn new(
        run_id: RunId,
        graph: TaskGraph,
        store: Arc<dyn StateStore>,
        dispatcher: Arc<Dispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            run_id,
            graph,
            store,
            dispatcher,
            config,
            cancel: CancellationToken::new(),
            events: None,
            ready: BTreeSet::new(),
            running: HashMap::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Drive the graph until every task is terminal or cancellation stops
    /// admission and the in-flight tasks have drained.
    ///
    /// # Errors
    /// Any state store failure is returned immediately and ends the run's
    /// scheduling; the store still holds the last committed transition.
    pub async fn run(mut self) -> Result<ScheduleReport> {
        let max = self.config.max_concurrency.max(1);
        info!(
            run_id = %self.run_id,
            tasks = self.graph.len(),
            max_concurrency = max,
            "scheduler starting"
        );
        self.prime().await?;

        let mut workers: JoinSet<(TaskId, WorkerOutcome)> = JoinSet::new();
        loop {
            while workers.len() < max && !self.cancel.is_cancelled() {
                let Some(position) = self.ready.pop_first() else {
                    break;
                };
                self.start(position, &mut workers).await?;
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            match joined {
                Ok((task_id, outcome)) => {
                    self.running.retain(|_, id| id != &task_id);
                    self.complete(&task_id, outcome).await?;
                }
                Err(join_error) => {
                    let Some(task_id) = self.running.remove(&join_error.id()) else {
                        error!(error = %join_error, "lost track of a finished worker");
                        continue;
                    };
                    warn!(task_id = %task_id, error = %join_error, "worker panicked");
                    let detail = format!("worker panicked: {}", join_error);
                    self.complete(&task_id, WorkerOutcome::Finished(TaskResult::transient(detail)))
                        .await?;
                }
            }
        }

        let outcome = if self.graph.all_terminal() {
            self.emit(SchedulerEvent::AllTasksComplete);
            ScheduleOutcome::Completed
        } else if self.cancel.is_cancelled() {
            ScheduleOutcome::Cancelled
        } else {
            return Err(Error::Validation(format!(
                "scheduler for run {} stalled with unfinished tasks",
                self.run_id
            )));
        };

        let counts = self.graph.counts();
        info!(
            run_id = %self.run_id,
            ?outcome,
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            "scheduler finished"
        );
        Ok(ScheduleReport {
            outcome,
            counts,
            graph: self.graph,
        })
    }

    /// Bring the graph to a schedulable state.
    ///
    /// Tasks left running by a previous process are interrupted and
    /// re-queued, interrupted tasks are re-queued, and pending tasks are
    /// promoted or skipped according to their dependencies.
    async fn prime(&mut self) -> Result<()> {
        let order = self.graph.topological_order()?;

        for id in &order {
            match self.status(id)? {
                TaskStatus::Running => {
                    warn!(run_id = %self.run_id, task_id = %id, "reconciling task left running");
                    self.commit(
                        id,
                        TaskStatus::Interrupted,
                        Some("no result was recorded before the run stopped".to_string()),
                    )
                    .await?;
                    self.log(id, LogEntry::warn("attempt interrupted, re-queued on resume"))
                        .await?;
                    self.mark_ready(id).await?;
                }
                TaskStatus::Interrupted => self.mark_ready(id).await?,
                TaskStatus::Ready => self.enqueue(id),
                _ => {}
            }
        }

        for id in &order {
            if self.status(id)? != TaskStatus::Pending {
                continue;
            }
            if let Some(blocker) = self.blocking_dependency(id) {
                self.skip(id, &blocker).await?;
            } else if self.graph.dependencies_satisfied(id) {
                self.mark_ready(id).await?;
            }
        }
        Ok(())
    }

    async fn start(
        &mut self,
        position: usize,
        workers: &mut JoinSet<(TaskId, WorkerOutcome)>,
    ) -> Result<()> {
        let task_id = match self.graph.task_at(position) {
            Some(task) => task.id.clone(),
            None => return Err(Error::TaskNotFound(format!("position {}", position))),
        };
        self.commit(&task_id, TaskStatus::Running, None).await?;

        let task: Task = self
            .graph
            .get(&task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        let attempt = task.attempts;
        let implementer = self
            .dispatcher
            .implementer_for(&task.role)
            .unwrap_or("unresolved")
            .to_string();
        self.log(
            &task_id,
            LogEntry::info(format!(
                "attempt {} started by {} via {}",
                attempt, task.role, implementer
            )),
        )
        .await?;
        info!(run_id = %self.run_id, task_id = %task_id, attempt, %implementer, "task started");
        self.emit(SchedulerEvent::TaskStarted {
            task_id: task_id.clone(),
            attempt,
        });

        let backoff = self
            .config
            .retry_backoff
            .saturating_mul(attempt.saturating_sub(1));
        let grace = self.config.shutdown_grace;
        let cancel = self.cancel.clone();
        let dispatcher = Arc::clone(&self.dispatcher);

        let worker_id = task_id.clone();
        let handle = workers.spawn(async move {
            let outcome = run_worker(task, dispatcher, backoff, grace, cancel).await;
            (worker_id, outcome)
        });
        self.running.insert(handle.id(), task_id);
        Ok(())
    }

    async fn complete(&mut self, id: &TaskId, outcome: WorkerOutcome) -> Result<()> {
        let attempt = self
            .graph
            .get(id)
            .map(|t| t.attempts)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

        match outcome {
            WorkerOutcome::Finished(TaskResult::Success { output }) => {
                self.commit(id, TaskStatus::Succeeded, Some(output)).await?;
                self.log(id, LogEntry::info(format!("attempt {} succeeded", attempt)))
                    .await?;
                info!(run_id = %self.run_id, task_id = %id, attempt, "task succeeded");
                self.emit(SchedulerEvent::TaskSucceeded {
                    task_id: id.clone(),
                });
                self.release_dependents(id).await?;
            }
            WorkerOutcome::Finished(TaskResult::Failure { kind, detail }) => {
                if kind == FailureKind::Transient && attempt < self.config.max_attempts {
                    self.log(
                        id,
                        LogEntry::warn(format!(
                            "attempt {} failed ({}): {}; retrying",
                            attempt,
                            kind,
                            truncate(&detail, LOG_DETAIL_CHARS)
                        )),
                    )
                    .await?;
                    self.commit(id, TaskStatus::Ready, Some(detail.clone()))
                        .await?;
                    self.enqueue(id);
                    warn!(run_id = %self.run_id, task_id = %id, attempt, detail = %detail, "task will retry");
                    self.emit(SchedulerEvent::TaskRetrying {
                        task_id: id.clone(),
                        attempt,
                        detail,
                    });
                } else {
                    self.commit(id, TaskStatus::Failed, Some(detail.clone()))
                        .await?;
                    self.log(
                        id,
                        LogEntry::error(format!(
                            "attempt {} failed ({}): {}",
                            attempt,
                            kind,
                            truncate(&detail, LOG_DETAIL_CHARS)
                        )),
                    )
                    .await?;
                    error!(run_id = %self.run_id, task_id = %id, attempt, %kind, "task failed");
                    self.emit(SchedulerEvent::TaskFailed {
                        task_id: id.clone(),
                        kind,
                        detail,
                    });
                    self.skip_dependents(id).await?;
                }
            }
            WorkerOutcome::Interrupted => {
                self.commit(
                    id,
                    TaskStatus::Interrupted,
                    Some("interrupted by cancellation".to_string()),
                )
                .await?;
                self.log(
                    id,
                    LogEntry::warn(format!("attempt {} interrupted by cancellation", attempt)),
                )
                .await?;
                warn!(run_id = %self.run_id, task_id = %id, "task interrupted");
                self.emit(SchedulerEvent::TaskInterrupted {
                    task_id: id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Promote pending dependents whose dependencies have all succeeded.
    async fn release_dependents(&mut self, id: &TaskId) -> Result<()> {
        for dependent in self.graph.dependents_of(id) {
            if self.status(&dependent)? == TaskStatus::Pending
                && self.graph.dependencies_satisfied(&dependent)
            {
                self.mark_ready(&dependent).await?;
            }
        }
        Ok(())
    }

    /// Skip every pending task reachable from a failed task.
    async fn skip_dependents(&mut self, failed: &TaskId) -> Result<()> {
        let mut queue: VecDeque<(TaskId, TaskId)> = self
            .graph
            .dependents_of(failed)
            .into_iter()
            .map(|d| (d, failed.clone()))
            .collect();

        while let Some((id, cause)) = queue.pop_front() {
            if self.status(&id)? != TaskStatus::Pending {
                continue;
            }
            self.skip(&id, &cause).await?;
            for next in self.graph.dependents_of(&id) {
                queue.push_back((next, id.clone()));
            }
        }
        Ok(())
    }

    async fn skip(&mut self, id: &TaskId, cause: &TaskId) -> Result<()> {
        let reason = format!("dependency {} did not succeed", cause);
        self.commit(id, TaskStatus::Skipped, Some(reason.clone()))
            .await?;
        self.log(id, LogEntry::warn(reason)).await?;
        debug!(run_id = %self.run_id, task_id = %id, blocked_by = %cause, "task skipped");
        self.emit(SchedulerEvent::TaskSkipped {
            task_id: id.clone(),
            blocked_by: cause.clone(),
        });
        Ok(())
    }

    async fn mark_ready(&mut self, id: &TaskId) -> Result<()> {
        self.commit(id, TaskStatus::Ready, None).await?;
        self.enqueue(id);
        self.emit(SchedulerEvent::TaskReady {
            task_id: id.clone(),
        });
        Ok(())
    }

    fn enqueue(&mut self, id: &TaskId) {
        if let Some(position) = self.graph.position(id) {
            self.ready.insert(position);
        }
    }

    fn blocking_dependency(&self, id: &TaskId) -> Option<TaskId> {
        self.graph
            .dependencies_of(id)
            .into_iter()
            .find(|dep| dep.status.blocks_dependents())
            .map(|dep| dep.id.clone())
    }

    fn status(&self, id: &TaskId) -> Result<TaskStatus> {
        self.graph
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// The single transition function: validate, persist, then apply.
    async fn commit(&mut self, id: &TaskId, to: TaskStatus, payload: Option<String>) -> Result<()> {
        let from = self.status(id)?;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                task: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let mut transition = Transition::new(id.clone(), from, to);
        transition.payload = payload;
        self.store
            .record_task_transition(&self.run_id, &transition)
            .await?;
        self.graph
            .apply(id, to, transition.payload.as_deref(), transition.at)
    }

    async fn log(&self, id: &TaskId, entry: LogEntry) -> Result<()> {
        self.store.append_log(&self.run_id, id, &entry).await
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// One attempt of one task: optional backoff, then a single dispatch.
///
/// After cancellation the dispatch may keep running for `grace`; past that
/// it is dropped and the attempt reports `Interrupted`. A cancellation
/// during backoff interrupts immediately.
async fn run_worker(
    task: Task,
    dispatcher: Arc<Dispatcher>,
    backoff: Duration,
    grace: Duration,
    cancel: CancellationToken,
) -> WorkerOutcome {
    if !backoff.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => return WorkerOutcome::Interrupted,
        }
    }

    let deadline = async {
        cancel.cancelled().await;
        tokio::time::sleep(grace).await;
    };
    tokio::select! {
        result = dispatcher.execute(&task) => WorkerOutcome::Finished(result),
        _ = deadline => WorkerOutcome::Interrupted,
    }
}
