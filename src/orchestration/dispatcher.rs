//! Task dispatch: bind a task to its agent and run the agent's implementer.
//!
//! The dispatcher makes exactly one implementer call per task. It never
//! retries and never touches task status; it only reports a [`TaskResult`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use super::claude::ClaudeHeadless;
use crate::agent::{AgentDefinition, AgentRegistry};
use crate::config::{CommandSpec, ProjectConfig, ProjectStructure, DEFAULT_IMPLEMENTER};
use crate::core::Task;
use crate::Error;

/// Substrings that mark a failure as infrastructure trouble rather than a
/// task the implementer could not complete. Matched case-insensitively.
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "overloaded",
    "quota exceeded",
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "broken pipe",
    "temporarily unavailable",
    "service unavailable",
    "network is unreachable",
];

/// HTTP statuses that signal throttling or an unavailable backend.
static TRANSIENT_STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(408|429|502|503|504|529)\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Infrastructure failure; the same task may succeed if retried.
    Transient,
    /// The implementer ran and could not complete the task.
    Semantic,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Semantic => write!(f, "semantic"),
        }
    }
}

/// Outcome of one implementer call.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Success { output: String },
    Failure { kind: FailureKind, detail: String },
}

impl TaskResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self::Success {
            output: output.into(),
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::Failure {
            kind: FailureKind::Transient,
            detail: detail.into(),
        }
    }

    pub fn semantic(detail: impl Into<String>) -> Self {
        Self::Failure {
            kind: FailureKind::Semantic,
            detail: detail.into(),
        }
    }

    /// A failure whose kind is decided by [`classify_failure`].
    pub fn failure(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::Failure {
            kind: classify_failure(&detail),
            detail,
        }
    }
}

pub fn classify_failure(detail: &str) -> FailureKind {
    let lower = detail.to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) || TRANSIENT_STATUS_RE.is_match(&lower)
    {
        FailureKind::Transient
    } else {
        FailureKind::Semantic
    }
}

/// Map an error raised while invoking an implementer to a task result.
/// Timeouts and process-launch failures are transient.
fn error_result(implementer: &str, err: Error) -> TaskResult {
    match err {
        Error::Timeout(d) => {
            TaskResult::transient(format!("{} timed out after {}s", implementer, d.as_secs()))
        }
        Error::Io(e) => TaskResult::transient(format!("failed to launch {}: {}", implementer, e)),
        other => TaskResult::failure(format!("{}: {}", implementer, other)),
    }
}

/// Repository the implementers work in.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoContext {
    pub project: String,
    pub repo_path: PathBuf,
    pub structure: ProjectStructure,
}

impl RepoContext {
    pub fn new(project: &str, repo_path: &Path) -> Self {
        Self {
            project: project.to_string(),
            repo_path: repo_path.to_path_buf(),
            structure: ProjectStructure::default(),
        }
    }

    pub fn from_project(project: &ProjectConfig) -> Self {
        Self {
            project: project.name.clone(),
            repo_path: project.repo_path.clone(),
            structure: project.structure.clone(),
        }
    }
}

/// External tool that performs the code-writing side effect of a task.
#[async_trait]
pub trait Implementer: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, instructions: &str, repo: &RepoContext) -> TaskResult;
}

/// Runs tasks through Claude Code in headless mode.
pub struct ClaudeCodeImplementer {
    claude: ClaudeHeadless,
}

impl ClaudeCodeImplementer {
    pub fn new(claude: ClaudeHeadless) -> Self {
        Self { claude }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(
            ClaudeHeadless::with_binary("claude")
                .with_timeout(timeout)
                .with_args(["--max-turns", "50", "--dangerously-skip-permissions"]),
        )
    }
}

#[async_trait]
impl Implementer for ClaudeCodeImplementer {
    fn name(&self) -> &str {
        DEFAULT_IMPLEMENTER
    }

    async fn run(&self, instructions: &str, repo: &RepoContext) -> TaskResult {
        match self.claude.execute(instructions, &repo.repo_path).await {
            Ok(reply) => match reply.into_result() {
                Ok(output) => TaskResult::success(output),
                Err(message) => TaskResult::failure(message),
            },
            Err(e) => error_result(self.name(), e),
        }
    }
}

/// Runs a configured program; `{prompt}` and `{repo}` in its arguments
/// are replaced per task.
pub struct CommandImplementer {
    name: String,
    spec: CommandSpec,
    timeout: Duration,
}

impl CommandImplementer {
    pub fn new(name: &str, spec: CommandSpec, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            spec,
            timeout,
        }
    }

    pub fn render_args(&self, instructions: &str, repo: &RepoContext) -> Vec<String> {
        let repo_path = repo.repo_path.to_string_lossy();
        self.spec
            .args
            .iter()
            .map(|arg| {
                arg.replace("{prompt}", instructions)
                    .replace("{repo}", &repo_path)
            })
            .collect()
    }
}

#[async_trait]
impl Implementer for CommandImplementer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, instructions: &str, repo: &RepoContext) -> TaskResult {
        let output = match tokio::time::timeout(
            self.timeout,
            Command::new(&self.spec.command)
                .args(self.render_args(instructions, repo))
                .current_dir(&repo.repo_path)
                .kill_on_drop(true)
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return error_result(&self.name, Error::Io(e)),
            Err(_) => return error_result(&self.name, Error::Timeout(self.timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return TaskResult::success(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        TaskResult::failure(format!(
            "{} exited with code {}: {}",
            self.name,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        ))
    }
}

/// Binds tasks to agents and agents to implementers.
pub struct Dispatcher {
    agents: Arc<AgentRegistry>,
    implementers: HashMap<String, Arc<dyn Implementer>>,
    default_implementer: String,
    repo: RepoContext,
}

impl Dispatcher {
    pub fn new(agents: Arc<AgentRegistry>, repo: RepoContext, default_implementer: &str) -> Self {
        Self {
            agents,
            implementers: HashMap::new(),
            default_implementer: default_implementer.to_string(),
            repo,
        }
    }

    /// Dispatcher with the built-in Claude implementer plus every
    /// `[implementers.*]` entry of the project.
    pub fn for_project(project: &ProjectConfig, agents: Arc<AgentRegistry>) -> Self {
        let timeout = project.settings.implementer_timeout();
        let mut dispatcher = Self::new(
            agents,
            RepoContext::from_project(project),
            &project.settings.implementer,
        )
        .with_implementer(Arc::new(ClaudeCodeImplementer::with_timeout(timeout)));
        for (name, spec) in &project.implementers {
            dispatcher = dispatcher.with_implementer(Arc::new(CommandImplementer::new(
                name,
                spec.clone(),
                timeout,
            )));
        }
        dispatcher
    }

    /// Register an implementer under its own name, replacing any previous one.
    pub fn with_implementer(mut self, implementer: Arc<dyn Implementer>) -> Self {
        self.implementers
            .insert(implementer.name().to_string(), implementer);
        self
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// The agent's own binding wins over the project default.
    pub fn implementer_name<'a>(&'a self, agent: &'a AgentDefinition) -> &'a str {
        agent
            .implementer
            .as_deref()
            .unwrap_or(&self.default_implementer)
    }

    /// Implementer a task of `role` would run on, if the role is known.
    pub fn implementer_for(&self, role: &str) -> Option<&str> {
        self.agents
            .resolve(role)
            .ok()
            .map(|agent| self.implementer_name(agent))
    }

    pub fn build_prompt(&self, task: &Task, agent: &AgentDefinition) -> String {
        let structure = &self.repo.structure;
        let mut parts = vec![
            agent.system_prompt.clone(),
            String::new(),
            "---".to_string(),
            String::new(),
            format!("## Task: {}", task.title),
            String::new(),
        ];
        if !task.description.is_empty() {
            parts.push(task.description.clone());
            parts.push(String::new());
        }
        parts.push(format!("**Ticket:** {}", task.ticket_id));
        parts.push(format!("**Project path:** {}", self.repo.repo_path.display()));
        if let Some(language) = &structure.language {
            parts.push(format!("**Language:** {}", language));
        }
        if let Some(framework) = &structure.framework {
            parts.push(format!("**Framework:** {}", framework));
        }
        if let Some(test_runner) = &structure.test_runner {
            parts.push(format!("**Test runner:** {}", test_runner));
        }
        parts.join("\n")
    }

    /// Resolve the task's agent and run it.
    pub async fn execute(&self, task: &Task) -> TaskResult {
        match self.agents.resolve(&task.role) {
            Ok(agent) => self.execute_with(task, agent).await,
            Err(e) => {
                warn!(task_id = %task.id, role = %task.role, "no agent for task");
                TaskResult::semantic(e.to_string())
            }
        }
    }

    pub async fn execute_with(&self, task: &Task, agent: &AgentDefinition) -> TaskResult {
        let name = self.implementer_name(agent);
        let Some(implementer) = self.implementers.get(name) else {
            return TaskResult::semantic(format!(
                "agent {} is bound to unknown implementer '{}'",
                agent.name, name
            ));
        };
        debug!(task_id = %task.id, agent = %agent.name, implementer = name, "dispatching task");
        let prompt = self.build_prompt(task, agent);
        implementer.run(&prompt, &self.repo).await
    }
}
