use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ground_control::agent::{write_default_agents, AgentRegistry};
use ground_control::config::{ProjectConfig, Workspace, WorkspaceConfig, WORKSPACE_FILE};
use ground_control::core::{RunId, RunStatus, TaskStatus};
use ground_control::orchestration::{Orchestrator, RunSummary, SchedulerEvent};
use ground_control::state::{FileStateStore, StateStore};
use ground_control::tickets::{TicketSource, TomlTicketSource};
use ground_control::util::truncate;
use ground_control::{Error, Result};

const EXAMPLE_TICKET: &str = r#"id = "T-1"
title = "Add a health check endpoint"
description = "Expose GET /health returning 200 and the build version."
priority = "medium"
acceptance_criteria = ["GET /health returns 200", "covered by a test"]
"#;

/// Ground Control - ticket-driven multi-agent orchestrator
#[derive(Parser, Debug)]
#[command(name = "gc")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    GC_DEBUG=1      Enable debug logging (alternative to --debug)\n    GC_LOG=<filter> Full tracing filter directive")]
pub struct Cli {
    /// Enable debug logging (writes to <workspace>/.gc/gc.log)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Workspace root (defaults to the current directory)
    #[arg(short = 'd', long = "dir", global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Scaffold a workspace: gc.toml, agents, projects and tickets
    Init {
        /// Where to create the workspace (defaults to --dir or the current directory)
        path: Option<PathBuf>,
    },

    /// Plan and execute all open tickets of a project
    Run {
        /// Project name (projects/<PROJECT>.toml)
        project: String,
    },

    /// Resume an interrupted run
    Resume {
        run_id: String,

        #[arg(long, short = 'p')]
        project: String,
    },

    /// Show the latest run, or the given one, with per-task status
    Status {
        #[arg(long)]
        run_id: Option<String>,
    },

    /// List agent definitions
    Agents,

    /// List the tickets of a project
    Tickets { project: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = match &cli.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    if let Command::Init { path } = &cli.command {
        return run_init(path.as_deref().unwrap_or(&root));
    }

    let workspace = Workspace::load(&root)?;
    if let Err(e) = ground_control::log::init(&workspace.log_dir(), cli.debug) {
        eprintln!("Warning: logging disabled: {}", e);
    }
    info!(command = ?cli.command, root = %root.display(), "gc starting");

    match cli.command {
        Command::Init { .. } => Ok(()),
        Command::Run { project } => run_project(&workspace, &project, None).await,
        Command::Resume { run_id, project } => {
            run_project(&workspace, &project, Some(RunId::from(run_id.as_str()))).await
        }
        Command::Status { run_id } => run_status(&workspace, run_id).await,
        Command::Agents => run_agents(&workspace),
        Command::Tickets { project } => run_tickets(&workspace, &project).await,
    }
}

fn run_init(root: &Path) -> Result<()> {
    let workspace = Workspace::with_config(root, WorkspaceConfig::default());
    if !root.join(WORKSPACE_FILE).exists() {
        workspace.save()?;
    }
    let created = write_default_agents(&workspace.agents_dir())?;
    fs::create_dir_all(workspace.projects_dir())?;
    fs::create_dir_all(root.join("tickets"))?;

    let example_project = workspace.project_path("example");
    if !example_project.exists() {
        let project = ProjectConfig::new("example", Path::new("."));
        fs::write(&example_project, toml::to_string_pretty(&project)?)?;
    }
    let example_ticket = root.join("tickets").join("T-1.toml");
    if !example_ticket.exists() {
        fs::write(&example_ticket, EXAMPLE_TICKET)?;
    }

    println!("Initialized workspace at {}", root.display());
    for path in created {
        println!("  created {}", path.display());
    }
    println!("Next: edit projects/example.toml, then run `gc run example`.");
    Ok(())
}

fn load_agents(workspace: &Workspace, project: &ProjectConfig) -> Result<Arc<AgentRegistry>> {
    let agents = AgentRegistry::load_dir(&workspace.agents_dir())?.restrict_to(&project.agents);
    if agents.is_empty() {
        return Err(Error::Validation(format!(
            "project {} enables no known agents",
            project.name
        )));
    }
    Ok(Arc::new(agents))
}

/// Start or resume a run, printing progress until it finishes or Ctrl-C
/// cancels it.
async fn run_project(workspace: &Workspace, name: &str, resume: Option<RunId>) -> Result<()> {
    let project = workspace.load_project(name)?;
    let agents = load_agents(workspace, &project)?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(&workspace.state_dir())?);

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::for_project(&project, agents, store)
        .with_cancellation(cancel.clone())
        .with_events(tx);

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling: waiting for running tasks to stop...");
            warn!("cancellation requested");
            signal_token.cancel();
        }
    });
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let summary = match resume {
        Some(run_id) => {
            println!("Resuming run {} ({})", run_id, project.name);
            orchestrator.resume(&run_id).await
        }
        None => {
            println!("Starting run for {}", project.name);
            orchestrator.run().await
        }
    };
    drop(orchestrator);
    let _ = printer.await;

    print_summary(&summary?);
    Ok(())
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::TaskStarted { task_id, attempt } => {
            println!("  [start]   {} (attempt {})", task_id, attempt)
        }
        SchedulerEvent::TaskSucceeded { task_id } => println!("  [done]    {}", task_id),
        SchedulerEvent::TaskRetrying {
            task_id,
            attempt,
            detail,
        } => println!(
            "  [retry]   {} after attempt {}: {}",
            task_id,
            attempt,
            truncate(detail, 80)
        ),
        SchedulerEvent::TaskFailed {
            task_id,
            kind,
            detail,
        } => println!("  [failed]  {} ({}): {}", task_id, kind, truncate(detail, 80)),
        SchedulerEvent::TaskSkipped {
            task_id,
            blocked_by,
        } => println!("  [skipped] {} (blocked by {})", task_id, blocked_by),
        SchedulerEvent::TaskInterrupted { task_id } => println!("  [stopped] {}", task_id),
        SchedulerEvent::TaskReady { .. } | SchedulerEvent::AllTasksComplete => {}
    }
}

fn print_summary(summary: &RunSummary) {
    let counts = &summary.counts;
    println!();
    println!("Run {}: {}", summary.run_id, format_status(summary.status));
    println!(
        "  succeeded {}  failed {}  skipped {}  outstanding {}",
        counts.succeeded,
        counts.failed,
        counts.skipped,
        counts.outstanding()
    );
    for (ticket, reason) in &summary.rejected {
        println!("  rejected ticket {}: {}", ticket, reason);
    }
    if !summary.is_finished() {
        println!(
            "  resume with: gc resume {} --project <PROJECT>",
            summary.run_id
        );
    }
}

fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Succeeded => format!("\x1b[32m{}\x1b[0m", status), // Green
        RunStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),    // Red
        RunStatus::Partial => format!("\x1b[33m{}\x1b[0m", status),   // Yellow
        RunStatus::Running => format!("\x1b[34m{}\x1b[0m", status),   // Blue
        RunStatus::Pending => format!("\x1b[90m{}\x1b[0m", status),   // Gray
    }
}

fn format_task_status(status: TaskStatus) -> String {
    match status {
        TaskStatus::Succeeded => format!("\x1b[32m{:<11}\x1b[0m", status.as_str()),
        TaskStatus::Failed => format!("\x1b[31m{:<11}\x1b[0m", status.as_str()),
        TaskStatus::Skipped | TaskStatus::Pending => format!("\x1b[90m{:<11}\x1b[0m", status.as_str()),
        _ => format!("\x1b[33m{:<11}\x1b[0m", status.as_str()),
    }
}

async fn run_status(workspace: &Workspace, run_id: Option<String>) -> Result<()> {
    let store = FileStateStore::open(&workspace.state_dir())?;
    let run_id = match run_id {
        Some(id) => RunId::from(id.as_str()),
        None => match store.list_runs().await?.into_iter().next() {
            Some(run) => run.id,
            None => {
                println!("No runs yet.");
                return Ok(());
            }
        },
    };

    let snapshot = store.load_run(&run_id).await?;
    let run = &snapshot.run;
    println!("Run {} ({})", run.id, run.project);
    println!("  status:  {}", format_status(run.status));
    println!(
        "  started: {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(ended) = run.ended_at {
        println!("  ended:   {}", ended.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    for task in &snapshot.tasks {
        println!(
            "  {} {:<30} {:<10} attempts {}",
            format_task_status(task.status),
            truncate(task.id.as_str(), 30),
            task.role,
            task.attempts
        );
        if let Some(result) = &task.result {
            if task.status != TaskStatus::Succeeded {
                println!("      {}", truncate(result.lines().next().unwrap_or(""), 100));
            }
        }
    }
    for (ticket, reason) in &snapshot.rejected {
        println!("  rejected ticket {}: {}", ticket, reason);
    }
    Ok(())
}

fn run_agents(workspace: &Workspace) -> Result<()> {
    let agents = AgentRegistry::load_dir(&workspace.agents_dir())?;
    if agents.is_empty() {
        println!("No agents defined. Run `gc init` to create the defaults.");
        return Ok(());
    }
    for agent in agents.agents() {
        println!("{:<12} {}", agent.name, agent.role);
        if !agent.capabilities.is_empty() {
            println!("             capabilities: {}", agent.capabilities.join(", "));
        }
        if let Some(implementer) = &agent.implementer {
            println!("             implementer:  {}", implementer);
        }
    }
    Ok(())
}

async fn run_tickets(workspace: &Workspace, name: &str) -> Result<()> {
    let project = workspace.load_project(name)?;
    let source = TomlTicketSource::new(&project.tickets.path);
    let tickets = source.list_tickets(&project.name).await?;
    if tickets.is_empty() {
        println!("No tickets in {}", project.tickets.path.display());
        return Ok(());
    }
    for ticket in tickets {
        println!(
            "{:<10} {:<12} {:<8} {}",
            ticket.id,
            ticket.status.to_string(),
            ticket.priority.to_string(),
            ticket.title
        );
        if !ticket.dependencies.is_empty() {
            println!("           depends on: {}", ticket.dependencies.join(", "));
        }
    }
    Ok(())
}
