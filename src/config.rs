use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

pub const WORKSPACE_FILE: &str = "gc.toml";
pub const MAX_PARALLEL_AGENTS_LIMIT: usize = 20;
pub const DEFAULT_IMPLEMENTER: &str = "claude_code";

/// Workspace-level layout, read from `gc.toml` at the workspace root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub agents_dir: String,
    pub projects_dir: String,
    pub state_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            agents_dir: "agents".to_string(),
            projects_dir: "projects".to_string(),
            state_dir: ".gc/state".to_string(),
        }
    }
}

/// A workspace root plus its resolved configuration.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    config: WorkspaceConfig,
}

impl Workspace {
    /// Load `gc.toml` from `root`, falling back to defaults when it is missing.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(WORKSPACE_FILE);
        debug!(path = %path.display(), "loading workspace config");
        let config = if path.exists() {
            toml::from_str(&fs::read_to_string(&path)?)?
        } else {
            debug!("workspace config not found, using defaults");
            WorkspaceConfig::default()
        };
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(
            self.root.join(WORKSPACE_FILE),
            toml::to_string_pretty(&self.config)?,
        )?;
        Ok(())
    }

    pub fn with_config(root: &Path, config: WorkspaceConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn agents_dir(&self) -> PathBuf {
        resolve(&self.root, &self.config.agents_dir)
    }

    pub fn projects_dir(&self) -> PathBuf {
        resolve(&self.root, &self.config.projects_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        resolve(&self.root, &self.config.state_dir)
    }

    /// Directory holding the process log (`<root>/.gc`).
    pub fn log_dir(&self) -> PathBuf {
        self.root.join(".gc")
    }

    pub fn project_path(&self, name: &str) -> PathBuf {
        self.projects_dir().join(format!("{}.toml", name))
    }

    /// Load and validate `projects/<name>.toml`.
    ///
    /// Relative `repo_path` and ticket paths resolve against the workspace root.
    pub fn load_project(&self, name: &str) -> Result<ProjectConfig> {
        let path = self.project_path(name);
        if !path.exists() {
            return Err(Error::ProjectNotFound(name.to_string()));
        }
        let mut project = ProjectConfig::from_toml(&fs::read_to_string(&path)?)?;
        project.resolve_paths(&self.root);
        project.validate()?;
        debug!(
            project = %project.name,
            repo = %project.repo_path.display(),
            max_parallel = project.settings.max_parallel_agents,
            "project config loaded"
        );
        Ok(project)
    }

    /// Names of all projects defined in the workspace, sorted.
    pub fn project_names(&self) -> Result<Vec<String>> {
        let dir = self.projects_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectStructure {
    pub language: Option<String>,
    pub framework: Option<String>,
    pub test_runner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketsConfig {
    #[serde(default = "default_tickets_path")]
    pub path: PathBuf,
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            path: default_tickets_path(),
        }
    }
}

fn default_tickets_path() -> PathBuf {
    PathBuf::from("tickets")
}

/// Run tuning knobs from the `[settings]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub max_parallel_agents: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub shutdown_grace_secs: u64,
    /// Project-wide default implementer, used when an agent has no binding.
    pub implementer: String,
    /// Binary backing the reasoning step of the planner.
    pub planner: String,
    pub implementer_timeout_secs: u64,
    pub planner_timeout_secs: u64,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            max_parallel_agents: 3,
            max_attempts: 3,
            retry_backoff_ms: 2000,
            shutdown_grace_secs: 30,
            implementer: DEFAULT_IMPLEMENTER.to_string(),
            planner: "claude".to_string(),
            implementer_timeout_secs: 600,
            planner_timeout_secs: 300,
        }
    }
}

impl ProjectSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn implementer_timeout(&self) -> Duration {
        Duration::from_secs(self.implementer_timeout_secs)
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner_timeout_secs)
    }
}

/// A custom implementer: a program plus an argument template.
///
/// `{prompt}` and `{repo}` inside any argument are substituted per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub repo_path: PathBuf,
    #[serde(default)]
    pub structure: ProjectStructure,
    #[serde(default)]
    pub tickets: TicketsConfig,
    /// Agent roles enabled for this project.
    #[serde(default = "default_agents")]
    pub agents: Vec<String>,
    #[serde(default)]
    pub settings: ProjectSettings,
    #[serde(default)]
    pub implementers: BTreeMap<String, CommandSpec>,
}

fn default_agents() -> Vec<String> {
    vec!["developer".to_string(), "reviewer".to_string()]
}

impl ProjectConfig {
    pub fn new(name: &str, repo_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            repo_path: repo_path.to_path_buf(),
            structure: ProjectStructure::default(),
            tickets: TicketsConfig::default(),
            agents: default_agents(),
            settings: ProjectSettings::default(),
            implementers: BTreeMap::new(),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Expand `~` and anchor relative paths at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        self.repo_path = resolve(base, &self.repo_path.to_string_lossy());
        self.tickets.path = resolve(base, &self.tickets.path.to_string_lossy());
    }

    /// Whether `name` refers to an implementer this project can build.
    pub fn knows_implementer(&self, name: &str) -> bool {
        name == DEFAULT_IMPLEMENTER || self.implementers.contains_key(name)
    }

    pub fn validate(&self) -> Result<()> {
        let settings = &self.settings;
        if self.name.trim().is_empty() {
            return Err(Error::Validation("project name is empty".to_string()));
        }
        if !(1..=MAX_PARALLEL_AGENTS_LIMIT).contains(&settings.max_parallel_agents) {
            return Err(Error::Validation(format!(
                "max_parallel_agents must be between 1 and {}, got {}",
                MAX_PARALLEL_AGENTS_LIMIT, settings.max_parallel_agents
            )));
        }
        if settings.max_attempts == 0 {
            return Err(Error::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if settings.implementer_timeout_secs == 0 || settings.planner_timeout_secs == 0 {
            return Err(Error::Validation(
                "implementer and planner timeouts must be positive".to_string(),
            ));
        }
        if self.agents.is_empty() {
            return Err(Error::Validation(format!(
                "project {} enables no agents",
                self.name
            )));
        }
        if !self.knows_implementer(&settings.implementer) {
            return Err(Error::Validation(format!(
                "unknown default implementer '{}'",
                settings.implementer
            )));
        }
        for (name, spec) in &self.implementers {
            if spec.command.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "implementer '{}' has an empty command",
                    name
                )));
            }
        }
        if !self.repo_path.is_dir() {
            return Err(Error::Validation(format!(
                "repo_path {} does not exist or is not a directory",
                self.repo_path.display()
            )));
        }
        Ok(())
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
