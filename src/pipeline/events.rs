//! Events emitted while a run progresses, and graph snapshots for display.

use crate::pipeline::id::{TaskId, TrialId};
use crate::pipeline::task::TaskState;
use crate::plugin::Stage;
use crate::trial::ResourceRef;
use std::time::Duration;

/// Messages sent from the scheduler to whoever observes a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Every task known when the run starts.
    Tasks(Vec<TaskSummary>),

    /// A task was checked out and handed to a worker.
    RunningTask(TaskSummary),

    /// Current dependency graph of the tasks still managed, and the time
    /// since the run started.
    DisplayGraph {
        graph: GraphSnapshot,
        elapsed: Duration,
    },

    /// A task's result was checked in.
    FinishedTask {
        task_id: TaskId,
        plugin: String,
        runtime: Duration,
    },

    /// A task failed, panicked, timed out or returned an unusable result.
    TaskError {
        task_id: TaskId,
        plugin: String,
        /// Full error chain or panic message.
        trace: String,
        runtime: Duration,
    },

    /// The run is over. Sent exactly once per run.
    FinishedRun(RunSummary),
}

/// Short description of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
    pub id: TaskId,
    pub plugin: String,
    pub stage: Stage,
    pub trials: Vec<TrialId>,
}

/// Counts gathered over one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub completed: usize,
    /// Redundant tasks skipped because an identical result already exists.
    pub skipped: usize,
    /// Tasks that could never run because an input has no data.
    pub impossible: usize,
    pub failed: usize,
    /// Pending tasks dropped after a failure.
    pub cancelled: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Snapshot of a single managed task.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: TaskId,
    pub plugin: String,
    pub stage: Stage,
    pub trials: Vec<TrialId>,
    pub state: TaskState,
}

/// `to` waits for `from` to write `resource`.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub from: TaskId,
    pub to: TaskId,
    pub resource: ResourceRef,
}

/// Task dependency graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphSnapshot {
    /// Tasks in dependency order (Kahn's algorithm).
    ///
    /// Tasks on a cycle are left out, so a result shorter than `nodes`
    /// means the graph has a cycle.
    pub fn execution_order(&self) -> Vec<TaskId> {
        let n = self.nodes.len();
        let index_of = |id: TaskId| self.nodes.iter().position(|node| node.id == id);

        let mut in_degree = vec![0u32; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in &self.edges {
            if let (Some(from), Some(to)) = (index_of(edge.from), index_of(edge.to)) {
                adj[from].push(to);
                in_degree[to] += 1;
            }
        }

        let mut queue: Vec<usize> = (0..n).rev().filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(node) = queue.pop() {
            order.push(self.nodes[node].id);
            for &next in &adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push(next);
                }
            }
        }

        if order.len() != n {
            tracing::warn!(
                "Task graph has a cycle! Only {} of {} tasks ordered.",
                order.len(),
                n
            );
        }
        order
    }

    pub fn has_cycle(&self) -> bool {
        self.execution_order().len() != self.nodes.len()
    }

    /// Tasks nothing else waits on.
    pub fn leaves(&self) -> Vec<TaskId> {
        self.nodes
            .iter()
            .map(|node| node.id)
            .filter(|&id| !self.edges.iter().any(|e| e.from == id))
            .collect()
    }
}
