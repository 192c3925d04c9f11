//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted implementers that record call order and peak concurrency
//! - Scripted reasoning services with per-ticket plans
//! - File-backed state stores in temporary directories

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use ground_control::agent::{AgentDefinition, AgentRegistry};
use ground_control::core::{Run, RunId, RunStatus, Task, Ticket};
use ground_control::orchestration::{
    Dispatcher, Implementer, Orchestrator, Planner, ProposedTask, ReasoningService, RepoContext,
    SchedulerConfig, TaskResult,
};
use ground_control::state::{FileStateStore, StateStore};
use ground_control::tickets::TicketSource;
use ground_control::{Error, Result};

/// What a scripted implementer does for one task title.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    /// Fail semantically every time.
    Fail(String),
    /// Fail transiently this many times, then succeed.
    Flaky(u32),
    /// Never return on its own.
    Hang,
    /// Panic inside the worker.
    Panic,
}

/// Implementer driven by task title. Unscripted titles succeed.
pub struct ScriptedImplementer {
    delay: Duration,
    behaviors: Mutex<HashMap<String, Behavior>>,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedImplementer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            behaviors: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, title: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(title.to_string(), behavior);
    }

    /// Titles in the order their attempts started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Titles in the order their attempts returned.
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    pub fn calls_for(&self, title: &str) -> usize {
        self.started().iter().filter(|t| *t == title).count()
    }

    /// Most attempts ever in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn title_of(instructions: &str) -> String {
        instructions
            .lines()
            .find_map(|line| line.strip_prefix("## Task: "))
            .unwrap_or_default()
            .to_string()
    }

    fn next_result(&self, title: &str) -> Option<TaskResult> {
        let mut behaviors = self.behaviors.lock().unwrap();
        match behaviors.get_mut(title) {
            None | Some(Behavior::Succeed) => Some(TaskResult::success(format!("{} done", title))),
            Some(Behavior::Fail(detail)) => Some(TaskResult::semantic(detail.clone())),
            Some(Behavior::Flaky(left)) if *left > 0 => {
                *left -= 1;
                Some(TaskResult::transient("HTTP 429: rate limit exceeded"))
            }
            Some(Behavior::Flaky(_)) => Some(TaskResult::success(format!("{} done", title))),
            Some(Behavior::Hang) | Some(Behavior::Panic) => None,
        }
    }
}

/// Decrements the active count even when the attempt is dropped.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Implementer for ScriptedImplementer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, instructions: &str, _repo: &RepoContext) -> TaskResult {
        let title = Self::title_of(instructions);
        self.started.lock().unwrap().push(title.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        tokio::time::sleep(self.delay).await;
        if matches!(self.behaviors.lock().unwrap().get(&title), Some(Behavior::Panic)) {
            panic!("scripted panic in {}", title);
        }
        let result = match self.next_result(&title) {
            Some(result) => result,
            None => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                TaskResult::semantic("hang ended")
            }
        };
        self.finished.lock().unwrap().push(title);
        result
    }
}

/// Reasoning service with a fixed answer per ticket id.
/// Tickets without a script get a single developer task.
#[derive(Default)]
pub struct ScriptedReasoner {
    plans: HashMap<String, std::result::Result<Vec<ProposedTask>, String>>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(mut self, ticket: &str, tasks: Vec<ProposedTask>) -> Self {
        self.plans.insert(ticket.to_string(), Ok(tasks));
        self
    }

    pub fn fail(mut self, ticket: &str, reason: &str) -> Self {
        self.plans.insert(ticket.to_string(), Err(reason.to_string()));
        self
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoner {
    async fn propose_decomposition(
        &self,
        ticket: &Ticket,
        _roles: &[String],
    ) -> Result<Vec<ProposedTask>> {
        match self.plans.get(&ticket.id) {
            Some(Ok(tasks)) => Ok(tasks.clone()),
            Some(Err(reason)) => Err(Error::Validation(reason.clone())),
            None => Ok(vec![ProposedTask::new("work", &ticket.id, "developer")]),
        }
    }
}

pub struct StaticTickets(pub Vec<Ticket>);

#[async_trait]
impl TicketSource for StaticTickets {
    async fn list_tickets(&self, _project: &str) -> Result<Vec<Ticket>> {
        Ok(self.0.clone())
    }
}

/// A file-backed store in a temp directory plus a scripted implementer.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<FileStateStore>,
    pub implementer: Arc<ScriptedImplementer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(5))
    }

    pub fn with_delay(delay: Duration) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(FileStateStore::open(dir.path()).expect("Failed to open store"));
        Self {
            dir,
            store,
            implementer: Arc::new(ScriptedImplementer::new(delay)),
        }
    }

    /// Replace the store with a fresh one over the same directory, as a
    /// restarted process would see it.
    pub fn restart(&mut self) {
        self.store = Arc::new(FileStateStore::open(self.dir.path()).expect("Failed to reopen store"));
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        let agents = Arc::new(AgentRegistry::new(vec![
            AgentDefinition::new("developer", "Developer", &["write_code"]),
            AgentDefinition::new("reviewer", "Reviewer", &["review_code"]),
        ]));
        Arc::new(
            Dispatcher::new(agents, RepoContext::new("demo", Path::new(".")), "scripted")
                .with_implementer(self.implementer.clone()),
        )
    }

    pub fn orchestrator(
        &self,
        tickets: Vec<Ticket>,
        reasoner: ScriptedReasoner,
        config: SchedulerConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            "demo",
            self.store.clone(),
            Arc::new(StaticTickets(tickets)),
            Planner::new(Arc::new(reasoner)),
            self.dispatcher(),
            config,
        )
    }

    /// Create a running run with `tasks` registered and the plan closed,
    /// as the orchestrator would before scheduling.
    pub async fn seed_run(&self, run_id: &str, tasks: &[Task]) -> RunId {
        let run = Run::new(RunId::from(run_id), "demo");
        self.store.create_run(&run).await.unwrap();
        self.store
            .update_run_status(&run.id, RunStatus::Running)
            .await
            .unwrap();
        self.store.register_tasks(&run.id, tasks).await.unwrap();
        self.store.mark_planned(&run.id).await.unwrap();
        run.id
    }
}

pub fn config(max_concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency,
        max_attempts: 3,
        retry_backoff: Duration::from_millis(1),
        shutdown_grace: Duration::from_millis(50),
    }
}

/// A developer task whose title equals its id.
pub fn task(id: &str, deps: &[&str]) -> Task {
    Task::new(id, "T-1", id, "developer").with_dependencies(deps.iter().copied())
}

pub fn independent_tasks(count: usize) -> Vec<Task> {
    (1..=count).map(|i| task(&format!("task-{}", i), &[])).collect()
}

/// Diamond: a -> {b, c} -> d.
pub fn diamond() -> Vec<Task> {
    vec![
        task("a", &[]),
        task("b", &["a"]),
        task("c", &["a"]),
        task("d", &["b", "c"]),
    ]
}
