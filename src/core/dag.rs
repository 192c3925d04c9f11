//! Task graph for dependency management.
//!
//! `TaskGraph` stores a run's tasks as a directed acyclic graph on top of
//! petgraph's `DiGraph`. Edges point from a dependency to its dependent.
//! Node insertion order is the declaration order, which the scheduler uses
//! to break ties between ready tasks.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{PlanningError, Result};
use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Number of tasks in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub interrupted: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending
            + self.ready
            + self.running
            + self.succeeded
            + self.failed
            + self.skipped
            + self.interrupted
    }

    /// Tasks that finished without succeeding.
    pub fn unsuccessful(&self) -> usize {
        self.failed + self.skipped
    }

    /// Tasks that can still make progress.
    pub fn outstanding(&self) -> usize {
        self.pending + self.ready + self.running + self.interrupted
    }

    pub(crate) fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Ready => self.ready += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Skipped => self.skipped += 1,
            TaskStatus::Interrupted => self.interrupted += 1,
        }
    }
}

/// The task dependency graph of one ticket or one run.
#[derive(Clone)]
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a validated graph from tasks that carry their own dependency lists.
    ///
    /// # Errors
    /// Fails on duplicate ids, self-dependencies, dependencies outside the
    /// given set, or a cycle.
    pub fn from_tasks(tasks: Vec<Task>) -> std::result::Result<Self, PlanningError> {
        let mut graph = Self::new();
        let mut edges = Vec::new();
        for task in tasks {
            for dep in &task.dependencies {
                edges.push((dep.clone(), task.id.clone()));
            }
            graph.insert(task)?;
        }
        for (dep, dependent) in edges {
            graph.link(&dep, &dependent)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Add a task to the graph.
    ///
    /// Dependencies listed on the task are not linked; use
    /// [`TaskGraph::add_dependency`] or [`TaskGraph::from_tasks`].
    pub fn add_task(&mut self, mut task: Task) -> std::result::Result<NodeIndex, PlanningError> {
        task.dependencies.clear();
        self.insert(task)
    }

    fn insert(&mut self, task: Task) -> std::result::Result<NodeIndex, PlanningError> {
        if self.task_index.contains_key(&task.id) {
            return Err(PlanningError::DuplicateTask {
                task: task.id.to_string(),
            });
        }
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        Ok(index)
    }

    /// Declare that `dependent` cannot start before `dependency` succeeds.
    ///
    /// Cycles are not checked here; call [`TaskGraph::validate`] once the
    /// graph is complete.
    pub fn add_dependency(
        &mut self,
        dependency: &TaskId,
        dependent: &TaskId,
    ) -> std::result::Result<(), PlanningError> {
        let added = self.link(dependency, dependent)?;
        if added {
            if let Some(&index) = self.task_index.get(dependent) {
                self.graph[index].dependencies.push(dependency.clone());
            }
        }
        Ok(())
    }

    /// Add the edge only. Returns whether a new edge was created.
    fn link(
        &mut self,
        dependency: &TaskId,
        dependent: &TaskId,
    ) -> std::result::Result<bool, PlanningError> {
        if dependency == dependent {
            return Err(PlanningError::SelfDependency {
                task: dependent.to_string(),
            });
        }
        let unknown = || PlanningError::UnknownDependency {
            task: dependent.to_string(),
            dependency: dependency.to_string(),
        };
        let from = *self.task_index.get(dependency).ok_or_else(unknown)?;
        let to = *self.task_index.get(dependent).ok_or_else(unknown)?;

        if self.graph.find_edge(from, to).is_some() {
            return Ok(false);
        }
        self.graph.add_edge(from, to, ());
        Ok(true)
    }

    /// Check the graph is acyclic.
    pub fn validate(&self) -> std::result::Result<(), PlanningError> {
        self.topological_order().map(|_| ())
    }

    /// Order tasks so every task comes after its dependencies.
    ///
    /// Uses Kahn's algorithm. Among the tasks whose dependencies are all
    /// placed, the earliest declared comes next, so the result is
    /// deterministic. If nodes remain with nonzero in-degree
    /// once no zero in-degree node is left, the graph is cyclic and the
    /// remaining nodes are reported.
    pub fn topological_order(&self) -> std::result::Result<Vec<TaskId>, PlanningError> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count()
            })
            .collect();

        let mut available: BTreeSet<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|index| in_degree[index.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(index) = available.pop_first() {
            order.push(self.graph[index].id.clone());
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    available.insert(next);
                }
            }
        }

        if order.len() < self.graph.node_count() {
            let tasks = self
                .graph
                .node_indices()
                .filter(|index| in_degree[index.index()] > 0)
                .map(|index| self.graph[index].id.to_string())
                .collect();
            return Err(PlanningError::Cycle { tasks });
        }
        Ok(order)
    }

    fn sorted_neighbors(&self, index: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(index, direction).collect();
        neighbors.sort();
        neighbors
    }

    /// Append every task of `other`, keeping its edges.
    pub fn merge(&mut self, other: TaskGraph) -> std::result::Result<(), PlanningError> {
        let tasks: Vec<Task> = other.into_tasks();
        let mut edges = Vec::new();
        for task in tasks {
            for dep in &task.dependencies {
                edges.push((dep.clone(), task.id.clone()));
            }
            self.insert(task)?;
        }
        for (dep, dependent) in edges {
            self.link(&dep, &dependent)?;
        }
        Ok(())
    }

    /// Consume the graph, returning tasks in declaration order.
    pub fn into_tasks(self) -> Vec<Task> {
        let (nodes, _) = self.graph.into_nodes_edges();
        nodes.into_iter().map(|node| node.weight).collect()
    }

    /// Get a reference to a task by its ID.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Declaration position of a task.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.task_index.get(id).map(|index| index.index())
    }

    /// Task at a declaration position.
    pub fn task_at(&self, position: usize) -> Option<&Task> {
        self.graph.node_weight(NodeIndex::new(position))
    }

    /// Apply a status transition to a task.
    ///
    /// This is the only mutable access to task state the graph exposes.
    pub fn apply(
        &mut self,
        id: &TaskId,
        to: TaskStatus,
        payload: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| crate::Error::TaskNotFound(id.to_string()))?;
        self.graph[index].apply(to, payload, at)
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Tasks the given task depends on, in declaration order.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .sorted_neighbors(index, Direction::Incoming)
                .into_iter()
                .map(|dep| &self.graph[dep])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Ids of tasks that depend on the given task, in declaration order.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .sorted_neighbors(index, Direction::Outgoing)
                .into_iter()
                .map(|next| self.graph[next].id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Ids of tasks without dependencies.
    pub fn roots(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|index| self.graph[index].id.clone())
            .collect()
    }

    /// Whether every dependency of the task has succeeded.
    pub fn dependencies_satisfied(&self, id: &TaskId) -> bool {
        self.dependencies_of(id)
            .iter()
            .all(|dep| dep.status == TaskStatus::Succeeded)
    }

    /// Whether some dependency of the task failed or was skipped.
    pub fn dependency_blocked(&self, id: &TaskId) -> bool {
        self.dependencies_of(id)
            .iter()
            .any(|dep| dep.status.blocks_dependents())
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.tasks() {
            counts.record(task.status);
        }
        counts
    }

    /// Whether every task is succeeded, failed, or skipped.
    pub fn all_terminal(&self) -> bool {
        self.tasks().all(Task::is_finished)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
