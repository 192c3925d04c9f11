//! Orchestration layer for ground-control.
//!
//! The planner turns tickets into a task graph, the scheduler runs that
//! graph with bounded concurrency, the dispatcher hands each task to an
//! implementer, and the orchestrator ties one run together end to end.

mod claude;
mod dispatcher;
mod orchestrator;
mod planner;
mod scheduler;

pub use claude::{ClaudeHeadless, ClaudeReply, DEFAULT_TIMEOUT_SECS};
pub use dispatcher::{
    classify_failure, ClaudeCodeImplementer, CommandImplementer, Dispatcher, FailureKind,
    Implementer, RepoContext, TaskResult, TRANSIENT_PATTERNS,
};
pub use orchestrator::{Orchestrator, RunSummary};
pub use planner::{
    build_graph, ClaudeReasoner, Planner, ProposedTask, ReasoningService, RejectedTicket, RunPlan,
};
pub use scheduler::{
    ScheduleOutcome, ScheduleReport, Scheduler, SchedulerConfig, SchedulerEvent,
};
