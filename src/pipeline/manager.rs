//! The scheduler: decides which pending tasks can run now.
//!
//! A pending task is held back while another pending task will still write
//! one of its inputs. A producer counts when it *originates* the resource,
//! or when it *modifies* it in place and was added earlier, so in-place
//! chains on one resource run in insertion order. Tasks whose inputs are
//! locked wait for the lock holder. Unblocked tasks with an input that has
//! no data can never run and are dropped, as are tasks that would only
//! repeat a computation already recorded on every output.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::events::{GraphEdge, GraphNode, GraphSnapshot, TaskSummary};
use crate::pipeline::id::TaskId;
use crate::pipeline::task::{RunInfo, Task, TaskState};
use crate::trial::{ResourceRef, TrialCollection};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Outcome of one scheduling pass.
#[derive(Debug, Default)]
pub struct PulledTasks {
    /// Tasks that may be checked out now; marked `Ready`.
    pub runnable: Vec<TaskId>,
    /// Redundant tasks, removed and skipped.
    pub skipped: Vec<Task>,
    /// Tasks with an input nobody will produce, removed and skipped.
    pub impossible: Vec<Task>,
}

impl PulledTasks {
    /// True if the pass changed the set of managed tasks.
    pub fn made_progress(&self) -> bool {
        !(self.runnable.is_empty() && self.skipped.is_empty() && self.impossible.is_empty())
    }
}

/// A pending writer of some resource.
#[derive(Debug, Clone, Copy)]
struct Producer {
    seq: u64,
    originates: bool,
}

#[derive(Debug, Default)]
pub struct TaskManager {
    /// Pending tasks keyed by insertion sequence.
    tasks: BTreeMap<u64, Task>,
    index: HashMap<TaskId, u64>,
    modifying: BTreeSet<u64>,
    non_modifying: BTreeSet<u64>,
    next_seq: u64,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: Task) -> TaskId {
        let seq = self.next_seq;
        self.next_seq += 1;

        let id = task.id();
        if task.is_modifying() {
            self.modifying.insert(seq);
        } else {
            self.non_modifying.insert(seq);
        }
        tracing::trace!("Added task {} ({}) at seq {}", id, task.plugin_name(), seq);
        self.index.insert(id, seq);
        self.tasks.insert(seq, task);
        id
    }

    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Task>) -> Vec<TaskId> {
        tasks.into_iter().map(|t| self.add_task(t)).collect()
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.index.get(&id).and_then(|seq| self.tasks.get(seq))
    }

    /// Managed tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.tasks.values().map(Task::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Pending writers per resource.
    fn producers(&self) -> HashMap<&ResourceRef, Vec<Producer>> {
        let mut producers: HashMap<&ResourceRef, Vec<Producer>> = HashMap::new();
        for (&seq, task) in &self.tasks {
            for r in task.provides() {
                producers.entry(r).or_default().push(Producer {
                    seq,
                    originates: !task.requires().contains(r),
                });
            }
        }
        producers
    }

    /// First pending producer that `task` (at `seq`) has to wait for.
    fn blocker(
        producers: &HashMap<&ResourceRef, Vec<Producer>>,
        seq: u64,
        task: &Task,
    ) -> Option<(u64, ResourceRef)> {
        task.requires().iter().find_map(|r| {
            producers.get(r).and_then(|list| {
                list.iter()
                    .find(|p| p.seq != seq && (p.originates || p.seq < seq))
                    .map(|p| (p.seq, r.clone()))
            })
        })
    }

    /// Run one scheduling pass.
    ///
    /// Non-modifying tasks are considered first. A batch never holds two
    /// tasks that write the same resource.
    pub fn pull_runnable_tasks(&mut self, trials: &mut TrialCollection) -> PulledTasks {
        let mut runnable = Vec::new();
        let mut redundant = Vec::new();
        let mut impossible = Vec::new();

        {
            let producers = self.producers();
            let mut batch_writes: HashSet<&ResourceRef> = HashSet::new();

            for seq in self.non_modifying.iter().chain(self.modifying.iter()) {
                let Some(task) = self.tasks.get(seq) else {
                    continue;
                };
                if Self::blocker(&producers, *seq, task).is_some() {
                    continue;
                }
                if !task.is_ready(trials) {
                    continue;
                }
                if !task.missing_requirements(trials).is_empty() {
                    impossible.push(*seq);
                    continue;
                }
                if !task.would_generate_unique_results(trials) {
                    redundant.push(*seq);
                    continue;
                }
                if task.provides().iter().any(|r| batch_writes.contains(r)) {
                    continue;
                }
                batch_writes.extend(task.provides().iter());
                runnable.push(*seq);
            }
        }

        let mut pulled = PulledTasks::default();
        for seq in runnable {
            if let Some(task) = self.tasks.get_mut(&seq) {
                if task.state() == TaskState::Pending {
                    if let Err(e) = task.transition(TaskState::Ready) {
                        tracing::warn!("{}", e);
                        continue;
                    }
                }
                pulled.runnable.push(task.id());
            }
        }
        for seq in redundant {
            if let Some(task) = self.remove_seq(seq) {
                tracing::info!(
                    "Skipping task {} ({}): results would be identical",
                    task.id(),
                    task.plugin_name()
                );
                pulled.skipped.push(Self::skip_task(task, trials));
            }
        }
        for seq in impossible {
            if let Some(task) = self.remove_seq(seq) {
                tracing::warn!(
                    "Task {} ({}) can never run: no data for {:?}",
                    task.id(),
                    task.plugin_name(),
                    task.missing_requirements(trials)
                        .iter()
                        .map(|r| r.to_string())
                        .collect::<Vec<_>>()
                );
                pulled.impossible.push(Self::skip_task(task, trials));
            }
        }
        pulled
    }

    fn skip_task(mut task: Task, trials: &mut TrialCollection) -> Task {
        if let Err(e) = task.skip(trials) {
            tracing::warn!("Could not skip task {}: {}", task.id(), e);
        }
        task
    }

    fn remove_seq(&mut self, seq: u64) -> Option<Task> {
        let task = self.tasks.remove(&seq)?;
        self.index.remove(&task.id());
        self.modifying.remove(&seq);
        self.non_modifying.remove(&seq);
        Some(task)
    }

    /// Remove a task from management and check out its resources.
    ///
    /// If checkout fails the task stays managed.
    pub fn checkout_task(
        &mut self,
        id: TaskId,
        trials: &mut TrialCollection,
    ) -> PipelineResult<(Task, RunInfo)> {
        let seq = *self.index.get(&id).ok_or(PipelineError::UnknownTask(id))?;
        let task = self
            .tasks
            .get_mut(&seq)
            .ok_or(PipelineError::UnknownTask(id))?;
        let run_info = task.get_run_info(trials)?;
        let task = self.remove_seq(seq).ok_or(PipelineError::UnknownTask(id))?;
        Ok((task, run_info))
    }

    /// Skip and remove every managed task.
    pub fn cancel_all(&mut self, trials: &mut TrialCollection) -> Vec<Task> {
        let seqs: Vec<u64> = self.tasks.keys().copied().collect();
        let cancelled: Vec<Task> = seqs
            .into_iter()
            .filter_map(|seq| self.remove_seq(seq))
            .map(|task| Self::skip_task(task, trials))
            .collect();
        if !cancelled.is_empty() {
            tracing::warn!("Cancelled {} pending task(s)", cancelled.len());
        }
        cancelled
    }

    /// Drop managed tasks matching `pred`, returning them untouched.
    pub fn remove_tasks_where<F>(&mut self, pred: F) -> Vec<Task>
    where
        F: Fn(&Task) -> bool,
    {
        let seqs: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, task)| pred(task))
            .map(|(&seq, _)| seq)
            .collect();
        seqs.into_iter().filter_map(|seq| self.remove_seq(seq)).collect()
    }

    /// Producer to consumer edges between managed tasks.
    pub fn dependency_graph(&self) -> GraphSnapshot {
        let producers = self.producers();
        let nodes = self
            .tasks
            .values()
            .map(|task| GraphNode {
                id: task.id(),
                plugin: task.plugin_name().to_string(),
                stage: task.stage(),
                trials: task.trials().to_vec(),
                state: task.state(),
            })
            .collect();

        let mut edges = Vec::new();
        for (&seq, task) in &self.tasks {
            for r in task.requires() {
                let Some(list) = producers.get(r) else {
                    continue;
                };
                for p in list.iter().filter(|p| p.seq != seq && (p.originates || p.seq < seq)) {
                    if let Some(from) = self.tasks.get(&p.seq) {
                        edges.push(GraphEdge {
                            from: from.id(),
                            to: task.id(),
                            resource: r.clone(),
                        });
                    }
                }
            }
        }

        GraphSnapshot { nodes, edges }
    }
}
