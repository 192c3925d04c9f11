//! Ticket decomposition.
//!
//! The judgment of how to split a ticket into steps belongs to a
//! [`ReasoningService`]. The planner only turns the proposed steps into a
//! validated [`TaskGraph`]: namespaced ids, known roles, dependencies inside
//! the same plan, no cycles. Any violation rejects the whole ticket.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::claude::ClaudeHeadless;
use crate::agent::AgentRegistry;
use crate::config::{ProjectConfig, ProjectStructure};
use crate::core::{Task, TaskGraph, TaskId, Ticket};
use crate::error::PlanningError;
use crate::{Error, Result};

/// One step as proposed by the reasoning service, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposedTask {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "untitled")]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Target agent name.
    #[serde(default, rename = "assigned_agent", alias = "role")]
    pub role: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn untitled() -> String {
    "Untitled task".to_string()
}

impl ProposedTask {
    pub fn new(id: &str, title: &str, role: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            title: title.to_string(),
            description: String::new(),
            role: role.to_string(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// External capability that proposes how to decompose a ticket.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn propose_decomposition(
        &self,
        ticket: &Ticket,
        roles: &[String],
    ) -> Result<Vec<ProposedTask>>;
}

/// Build a validated task graph from proposed steps.
///
/// Task ids become `<ticket-id>/<raw-id>`; steps without an id get `t<n>`
/// (1-based position). Dependencies name raw ids within the same proposal.
pub fn build_graph(
    ticket: &Ticket,
    proposed: &[ProposedTask],
    roles: &[String],
) -> std::result::Result<TaskGraph, PlanningError> {
    if proposed.is_empty() {
        return Err(PlanningError::EmptyPlan {
            ticket: ticket.id.clone(),
        });
    }

    let namespaced = |raw: &str| TaskId::new(format!("{}/{}", ticket.id, raw.trim()));

    let mut tasks = Vec::with_capacity(proposed.len());
    for (n, step) in proposed.iter().enumerate() {
        let raw = step
            .id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("t{}", n + 1));
        let id = namespaced(&raw);

        if !roles.iter().any(|r| r == &step.role) {
            return Err(PlanningError::UnknownRole {
                task: id.to_string(),
                role: step.role.clone(),
            });
        }

        tasks.push(
            Task::new(id, &ticket.id, &step.title, &step.role)
                .with_description(&step.description)
                .with_dependencies(step.dependencies.iter().map(|d| namespaced(d))),
        );
    }

    TaskGraph::from_tasks(tasks)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedTicket {
    pub ticket_id: String,
    pub error: PlanningError,
}

/// Combined plan for every open ticket of a run.
#[derive(Debug, Default)]
pub struct RunPlan {
    pub graph: TaskGraph,
    /// Tickets that produced tasks, in declaration order.
    pub planned: Vec<String>,
    pub rejected: Vec<RejectedTicket>,
}

pub struct Planner {
    reasoner: Arc<dyn ReasoningService>,
}

impl Planner {
    pub fn new(reasoner: Arc<dyn ReasoningService>) -> Self {
        Self { reasoner }
    }

    /// Decompose one ticket into a validated task graph.
    pub async fn decompose(
        &self,
        ticket: &Ticket,
        roles: &[String],
    ) -> std::result::Result<TaskGraph, PlanningError> {
        let proposed = self
            .reasoner
            .propose_decomposition(ticket, roles)
            .await
            .map_err(|e| PlanningError::Provider {
                ticket: ticket.id.clone(),
                reason: e.to_string(),
            })?;
        debug!(ticket = %ticket.id, proposed = proposed.len(), "decomposition proposed");
        build_graph(ticket, &proposed, roles)
    }

    /// Plan every open ticket in declaration order and join the results
    /// into one run graph.
    ///
    /// A ticket that depends on an earlier planned ticket has each of its
    /// root tasks depend on every task of that ticket. Depending on a
    /// rejected ticket, or on one declared later, rejects the ticket.
    /// Dependencies on tickets outside the open set count as satisfied.
    pub async fn plan_run(&self, tickets: &[Ticket], roles: &[String]) -> RunPlan {
        let open: Vec<&Ticket> = tickets.iter().filter(|t| t.is_open()).collect();
        let positions: HashMap<&str, usize> = open
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();

        let mut plan = RunPlan::default();
        let mut rejected: HashSet<String> = HashSet::new();
        let mut tasks_by_ticket: HashMap<String, Vec<TaskId>> = HashMap::new();

        for (index, ticket) in open.iter().enumerate() {
            let result = match check_ticket_dependencies(ticket, index, &positions, &rejected) {
                Ok(()) => match self.decompose(ticket, roles).await {
                    Ok(graph) => link_ticket(&mut plan.graph, graph, ticket, &tasks_by_ticket),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(ids) => {
                    info!(ticket = %ticket.id, tasks = ids.len(), "ticket planned");
                    tasks_by_ticket.insert(ticket.id.clone(), ids);
                    plan.planned.push(ticket.id.clone());
                }
                Err(error) => {
                    warn!(ticket = %ticket.id, error = %error, "ticket rejected");
                    rejected.insert(ticket.id.clone());
                    plan.rejected.push(RejectedTicket {
                        ticket_id: ticket.id.clone(),
                        error,
                    });
                }
            }
        }
        plan
    }
}

fn check_ticket_dependencies(
    ticket: &Ticket,
    index: usize,
    positions: &HashMap<&str, usize>,
    rejected: &HashSet<String>,
) -> std::result::Result<(), PlanningError> {
    for dep in &ticket.dependencies {
        let Some(&position) = positions.get(dep.as_str()) else {
            continue;
        };
        if position >= index {
            return Err(PlanningError::ForwardTicketDependency {
                ticket: ticket.id.clone(),
                dependency: dep.clone(),
            });
        }
        if rejected.contains(dep) {
            return Err(PlanningError::TicketDependencyRejected {
                ticket: ticket.id.clone(),
                dependency: dep.clone(),
            });
        }
    }
    Ok(())
}

/// Merge a ticket's graph into the run graph and add its cross-ticket edges.
/// Returns the ids of the ticket's tasks.
fn link_ticket(
    run_graph: &mut TaskGraph,
    graph: TaskGraph,
    ticket: &Ticket,
    tasks_by_ticket: &HashMap<String, Vec<TaskId>>,
) -> std::result::Result<Vec<TaskId>, PlanningError> {
    let roots = graph.roots();
    let ids: Vec<TaskId> = graph.tasks().map(|t| t.id.clone()).collect();

    let mut candidate = run_graph.clone();
    candidate.merge(graph)?;
    for dep in &ticket.dependencies {
        let Some(upstream) = tasks_by_ticket.get(dep) else {
            continue;
        };
        for root in &roots {
            for task in upstream {
                candidate.add_dependency(task, root)?;
            }
        }
    }
    *run_graph = candidate;
    Ok(ids)
}

/// Reasoning backed by Claude Code in headless mode.
pub struct ClaudeReasoner {
    claude: ClaudeHeadless,
    agents: Arc<AgentRegistry>,
    structure: ProjectStructure,
    cwd: PathBuf,
}

#[derive(Deserialize)]
struct PlanReply {
    #[serde(default)]
    tasks: Vec<ProposedTask>,
}

impl ClaudeReasoner {
    pub fn new(
        claude: ClaudeHeadless,
        agents: Arc<AgentRegistry>,
        structure: ProjectStructure,
        cwd: PathBuf,
    ) -> Self {
        Self {
            claude,
            agents,
            structure,
            cwd,
        }
    }

    pub fn for_project(project: &ProjectConfig, agents: Arc<AgentRegistry>) -> Self {
        Self::new(
            ClaudeHeadless::with_binary(&project.settings.planner)
                .with_timeout(project.settings.planner_timeout())
                .with_args(["--max-turns", "1"]),
            agents,
            project.structure.clone(),
            project.repo_path.clone(),
        )
    }

    pub fn build_prompt(&self, ticket: &Ticket, roles: &[String]) -> Result<String> {
        let agents: Vec<String> = self
            .agents
            .agents()
            .filter(|a| roles.contains(&a.name))
            .map(|a| {
                let caps = if a.capabilities.is_empty() {
                    "general".to_string()
                } else {
                    a.capabilities.join(", ")
                };
                format!("- {} ({}): capabilities=[{}]", a.name, a.role, caps)
            })
            .collect();
        let ticket_json = serde_json::to_string_pretty(&serde_json::json!({
            "id": ticket.id,
            "title": ticket.title,
            "description": ticket.description,
            "priority": ticket.priority.to_string(),
            "acceptance_criteria": ticket.acceptance_criteria,
        }))?;
        let or_none = |v: &Option<String>| v.clone().unwrap_or_else(|| "none".to_string());

        Ok(format!(
            "You are a project planning assistant. Decompose the ticket below into \
atomic tasks that one agent can each finish in a single session.\n\n\
Rules:\n\
- Assign each task to exactly one of the available agents, by name\n\
- Dependencies may only reference ids of other tasks in your answer\n\
- Do not create circular dependencies\n\
- Respond with JSON only\n\n\
Available agents:\n{agents}\n\n\
Project context:\n- Language: {language}\n- Framework: {framework}\n- Test runner: {test_runner}\n\n\
Ticket:\n{ticket_json}\n\n\
Respond with a JSON object:\n\
{{\"tasks\": [{{\"id\": \"t1\", \"title\": \"...\", \"description\": \"...\", \
\"assigned_agent\": \"<agent-name>\", \"dependencies\": []}}]}}\n",
            agents = agents.join("\n"),
            language = or_none(&self.structure.language),
            framework = or_none(&self.structure.framework),
            test_runner = or_none(&self.structure.test_runner),
            ticket_json = ticket_json,
        ))
    }

    /// Extract the `{"tasks": [...]}` object from a reply, ignoring any
    /// surrounding prose or code fences.
    pub fn parse_reply(reply: &str) -> Result<Vec<ProposedTask>> {
        let start = reply.find('{');
        let end = reply.rfind('}');
        let json = match (start, end) {
            (Some(s), Some(e)) if s < e => &reply[s..=e],
            _ => {
                return Err(Error::Validation(
                    "planner reply contains no JSON object".to_string(),
                ))
            }
        };
        let parsed: PlanReply = serde_json::from_str(json)?;
        Ok(parsed.tasks)
    }
}

#[async_trait]
impl ReasoningService for ClaudeReasoner {
    async fn propose_decomposition(
        &self,
        ticket: &Ticket,
        roles: &[String],
    ) -> Result<Vec<ProposedTask>> {
        let prompt = self.build_prompt(ticket, roles)?;
        let reply = self.claude.execute(&prompt, &self.cwd).await?;
        match reply.into_result() {
            Ok(text) => Self::parse_reply(&text),
            Err(message) => Err(Error::Validation(message)),
        }
    }
}
