//! Core domain models for ground-control orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: tickets, tasks, runs, and the task graph.

pub mod dag;
pub mod task;
pub mod ticket;

pub use dag::{StatusCounts, TaskGraph};
pub use task::{Run, RunId, RunStatus, Task, TaskId, TaskStatus};
pub use ticket::{Ticket, TicketPriority, TicketStatus};
