//! Agent definitions and the per-run registry.
//!
//! An agent file is Markdown with TOML front matter between `+++` fences:
//!
//! ```text
//! +++
//! name = "developer"
//! role = "Senior Software Developer"
//! capabilities = ["write_code", "run_tests"]
//! +++
//! You are a senior software developer...
//! ```
//!
//! Tasks target agents by `name`; `role` is the human-readable description.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::{Error, Result};

const FENCE: &str = "+++";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Implementer bound to this agent; overrides the project default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementer: Option<String>,
    #[serde(skip)]
    pub system_prompt: String,
}

impl AgentDefinition {
    pub fn new(name: &str, role: &str, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            implementer: None,
            system_prompt: String::new(),
        }
    }

    pub fn with_implementer(mut self, implementer: &str) -> Self {
        self.implementer = Some(implementer.to_string());
        self
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// Parse a Markdown agent file. `fallback_name` (usually the file stem)
    /// is used when the front matter omits `name`.
    pub fn parse(content: &str, fallback_name: &str) -> Result<Self> {
        let rest = content
            .trim_start()
            .strip_prefix(FENCE)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "agent '{}' has no {} front matter",
                    fallback_name, FENCE
                ))
            })?;
        let end = rest.find(&format!("\n{}", FENCE)).ok_or_else(|| {
            Error::Validation(format!(
                "agent '{}' front matter is not closed",
                fallback_name
            ))
        })?;
        let header = &rest[..end];
        let body = &rest[end + 1 + FENCE.len()..];

        let mut table: toml::Table = toml::from_str(header)?;
        table
            .entry("name")
            .or_insert_with(|| toml::Value::String(fallback_name.to_string()));
        let mut agent: AgentDefinition = toml::Value::Table(table).try_into()?;
        if agent.role.is_empty() {
            agent.role = agent.name.replace('-', " ");
        }
        agent.system_prompt = body.trim().to_string();
        Ok(agent)
    }

    pub fn to_markdown(&self) -> Result<String> {
        Ok(format!(
            "{fence}\n{}{fence}\n{}\n",
            toml::to_string(self)?,
            self.system_prompt,
            fence = FENCE
        ))
    }
}

/// Closed set of agents for one run, keyed by name.
///
/// Built once before scheduling and shared read-only behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentDefinition>,
}

impl AgentRegistry {
    pub fn new(definitions: impl IntoIterator<Item = AgentDefinition>) -> Self {
        Self {
            agents: definitions
                .into_iter()
                .map(|a| (a.name.clone(), a))
                .collect(),
        }
    }

    /// Load every `*.md` file in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Validation(format!(
                "agents directory not found: {}",
                dir.display()
            )));
        }
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
            .collect();
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in paths {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let agent = AgentDefinition::parse(&fs::read_to_string(&path)?, &stem)?;
            debug!(agent = %agent.name, path = %path.display(), "loaded agent");
            definitions.push(agent);
        }
        Ok(Self::new(definitions))
    }

    /// Keep only the agents named in `roles`. Unknown names are logged and ignored.
    pub fn restrict_to(self, roles: &[String]) -> Self {
        for role in roles {
            if !self.agents.contains_key(role) {
                warn!(role = %role, "project enables an agent with no definition");
            }
        }
        Self {
            agents: self
                .agents
                .into_iter()
                .filter(|(name, _)| roles.contains(name))
                .collect(),
        }
    }

    pub fn resolve(&self, role: &str) -> Result<&AgentDefinition> {
        self.agents
            .get(role)
            .ok_or_else(|| Error::AgentNotFound(role.to_string()))
    }

    /// Agent names, sorted.
    pub fn roles(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

pub fn default_agents() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition::new(
            "architect",
            "Software Architect",
            &["design_architecture", "review_technical_decisions", "create_technical_specs"],
        )
        .with_system_prompt(
            "You are a senior software architect. Analyze the task, decide on the \
             technical approach, and write down the files, data models and steps \
             a developer needs to implement it.",
        ),
        AgentDefinition::new(
            "developer",
            "Senior Software Developer",
            &["write_code", "run_tests", "fix_bugs", "refactor"],
        )
        .with_system_prompt(
            "You are a senior software developer. Implement the task with clean, \
             well-tested code that follows the existing patterns of the repository.",
        ),
        AgentDefinition::new(
            "reviewer",
            "Code Reviewer",
            &["review_code", "suggest_improvements", "verify_tests"],
        )
        .with_system_prompt(
            "You are an experienced code reviewer. Check the changes for bugs, \
             missing tests and security problems, and fix what you find.",
        ),
    ]
}

/// Write the default agent files into `dir`, leaving existing files alone.
/// Returns the paths that were created.
pub fn write_default_agents(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut created = Vec::new();
    for agent in default_agents() {
        let path = dir.join(format!("{}.md", agent.name));
        if path.exists() {
            continue;
        }
        fs::write(&path, agent.to_markdown()?)?;
        created.push(path);
    }
    Ok(created)
}
