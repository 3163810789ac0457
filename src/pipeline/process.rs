//! Top-level orchestration: strategies in, scheduled plugin runs out.
//!
//! The [`ProcessManager`] owns the open trials, the plugin registry and the
//! [`TaskManager`]. A run alternates between scheduling passes and waiting
//! on the worker pool:
//!
//! ```text
//! Strategy ──► build tasks ──► TaskManager ──pull──► checkout ──► WorkerPool
//!                                  ▲                                  │
//!                                  └──────── checkin results ◄────────┘
//! ```
//!
//! The first failing task cancels everything still pending; tasks already
//! handed to workers are drained before the run ends.

use crate::config::PipelineConfig;
use crate::error::{Result, ResultExt, SpikepipeError};
use crate::pipeline::error::PipelineError;
use crate::pipeline::events::{RunEvent, RunSummary};
use crate::pipeline::id::{TaskId, TrialId};
use crate::pipeline::manager::TaskManager;
use crate::pipeline::task::Task;
use crate::pipeline::worker::{WorkItem, WorkerPool};
use crate::plugin::{Plugin, PluginRegistry, Stage};
use crate::strategy::Strategy;
use crate::trial::{Trial, TrialCollection};
use crate::types::Settings;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Turns a file on disk into trials and/or strategies.
pub trait FileInterpreter: Send + Sync {
    fn interpret(&self, path: &Path) -> anyhow::Result<Vec<Interpreted>>;
}

/// Something a file interpreter produced.
#[derive(Debug, Clone)]
pub enum Interpreted {
    Trial(Trial),
    Strategy(Strategy),
}

/// Outcome of interpreting one file.
#[derive(Debug)]
pub struct OpenedFile {
    pub path: PathBuf,
    /// Interpreted content, or the rendered error chain.
    pub result: std::result::Result<Vec<Interpreted>, String>,
}

struct InFlight {
    task: Task,
    started: Instant,
}

/// Whether a task of `stage` (running alongside `runs_with`) belongs to the
/// stage selection `filter`. `None` selects everything.
fn stage_selected(filter: Option<Stage>, stage: Stage, runs_with: Option<Stage>) -> bool {
    match filter {
        None => true,
        Some(Stage::Auxiliary) => stage == Stage::Auxiliary,
        Some(selected) => {
            stage == selected || (stage == Stage::Auxiliary && runs_with == Some(selected))
        }
    }
}

fn emit_error(
    events: &Sender<RunEvent>,
    task_id: TaskId,
    plugin: &str,
    trace: String,
    runtime: Duration,
) {
    tracing::error!("Task {} ({}) failed: {}", task_id, plugin, trace);
    let _ = events.send(RunEvent::TaskError {
        task_id,
        plugin: plugin.to_string(),
        trace,
        runtime,
    });
}

pub struct ProcessManager {
    registry: PluginRegistry,
    trials: TrialCollection,
    tasks: TaskManager,
    config: PipelineConfig,
}

impl ProcessManager {
    pub fn new(registry: PluginRegistry, config: PipelineConfig) -> Self {
        Self {
            registry,
            trials: TrialCollection::new(),
            tasks: TaskManager::new(),
            config,
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PluginRegistry {
        &mut self.registry
    }

    pub fn trials(&self) -> &TrialCollection {
        &self.trials
    }

    pub fn trials_mut(&mut self) -> &mut TrialCollection {
        &mut self.trials
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn add_trial(&mut self, trial: Trial) -> TrialId {
        self.trials.add(trial)
    }

    fn plugin_for_stage(&self, name: &str, stage: Stage) -> Result<Arc<dyn Plugin>> {
        let plugin = self.registry.get(name)?;
        if plugin.info().stage != stage {
            return Err(PipelineError::TaskCreation(format!(
                "plugin '{}' belongs to stage {}, not {}",
                name,
                plugin.info().stage,
                stage
            ))
            .into());
        }
        Ok(plugin)
    }

    /// One task per marked trial, or one pooling task over all of them.
    fn tasks_for_plugin(
        &mut self,
        plugin: Arc<dyn Plugin>,
        stage: Stage,
        settings: &Settings,
        marked: &[TrialId],
    ) -> Result<Vec<Task>> {
        if marked.is_empty() {
            return Ok(Vec::new());
        }
        let name = plugin.name().to_string();
        let groups: Vec<Vec<TrialId>> = if plugin.info().is_pooling {
            vec![marked.to_vec()]
        } else {
            marked.iter().map(|&t| vec![t]).collect()
        };

        groups
            .into_iter()
            .map(|trial_ids| {
                Task::new(
                    Arc::clone(&plugin),
                    stage,
                    trial_ids,
                    settings.clone(),
                    &mut self.trials,
                )
                .with_context(|| format!("Failed to build task for plugin '{}'", name))
            })
            .collect()
    }

    /// Build the tasks a strategy asks for, without scheduling them.
    ///
    /// With no stage, every main stage is built in pipeline order, each
    /// followed by the auxiliary plugins that run alongside it, and then the
    /// remaining auxiliary plugins. Insertion order matters for in-place
    /// rewrites, which run in the order they were added.
    pub fn build_tasks_from_strategy(
        &mut self,
        strategy: &Strategy,
        stage: Option<Stage>,
    ) -> Result<Vec<Task>> {
        let marked = self.trials.marked_ids();

        let mut auxiliary = Vec::with_capacity(strategy.auxiliary_stages.len());
        for (name, settings) in &strategy.auxiliary_stages {
            let plugin = self.plugin_for_stage(name, Stage::Auxiliary)?;
            let runs_with = plugin.info().runs_with_stage;
            if stage_selected(stage, Stage::Auxiliary, runs_with) {
                auxiliary.push((plugin, settings, runs_with));
            }
        }

        let mut tasks = Vec::new();
        for main in Stage::PIPELINE {
            if !stage_selected(stage, main, None) {
                continue;
            }
            if let Some(name) = strategy.methods_used.get(&main) {
                let plugin = self.plugin_for_stage(name, main)?;
                let settings = strategy.stage_settings(main);
                tasks.extend(self.tasks_for_plugin(plugin, main, &settings, &marked)?);
            }
            for (plugin, settings, _) in auxiliary.iter().filter(|(_, _, rw)| *rw == Some(main)) {
                tasks.extend(self.tasks_for_plugin(
                    Arc::clone(plugin),
                    Stage::Auxiliary,
                    settings,
                    &marked,
                )?);
            }
        }
        for (plugin, settings, _) in auxiliary.iter().filter(|(_, _, rw)| rw.is_none()) {
            tasks.extend(self.tasks_for_plugin(
                Arc::clone(plugin),
                Stage::Auxiliary,
                settings,
                &marked,
            )?);
        }

        tracing::debug!(
            "Built {} task(s) from strategy '{}' ({})",
            tasks.len(),
            strategy.name,
            stage.map(|s| s.to_string()).unwrap_or_else(|| "all stages".to_string())
        );
        Ok(tasks)
    }

    /// Replace the pending tasks of the selected stages with freshly built
    /// ones. Returns the number of tasks added.
    pub fn prepare_strategy(&mut self, strategy: &Strategy, stage: Option<Stage>) -> Result<usize> {
        let tasks = self.build_tasks_from_strategy(strategy, stage)?;

        let obsolete = self.tasks.remove_tasks_where(|task| {
            stage_selected(stage, task.stage(), task.plugin().info().runs_with_stage)
        });
        if !obsolete.is_empty() {
            tracing::info!("Dropped {} obsolete pending task(s)", obsolete.len());
        }

        Ok(self.tasks.add_tasks(tasks).len())
    }

    /// Build, schedule and run a strategy on the calling thread.
    pub fn run(
        &mut self,
        strategy: &Strategy,
        stage: Option<Stage>,
        events: &Sender<RunEvent>,
    ) -> Result<RunSummary> {
        self.prepare_strategy(strategy, stage)?;
        self.run_tasks(events)
    }

    /// Run a strategy on a background thread that owns the manager.
    pub fn spawn_run(
        self,
        strategy: Strategy,
        stage: Option<Stage>,
        events: Sender<RunEvent>,
    ) -> Result<RunHandle> {
        let handle = std::thread::Builder::new()
            .name("spikepipe-run".to_string())
            .spawn(move || {
                let mut manager = self;
                let result = manager.run(&strategy, stage, &events);
                (manager, result)
            })?;
        Ok(RunHandle { handle })
    }

    /// Run every pending task to completion.
    ///
    /// Emits `Tasks` first and `FinishedRun` exactly once at the end. A
    /// failing task is reported as `TaskError` and does not make this
    /// return an error; check [`RunSummary::failed`].
    pub fn run_tasks(&mut self, events: &Sender<RunEvent>) -> Result<RunSummary> {
        if self.tasks.is_empty() {
            return Err(PipelineError::NoTasks.into());
        }

        let workers = self.config.workers.max_workers.min(self.tasks.len()).max(1);
        tracing::info!(
            "Running {} task(s) on {} worker(s)",
            self.tasks.len(),
            workers
        );
        let pool = WorkerPool::new(workers)?;
        self.run_on_pool(pool, events)
    }

    /// Drive the pending tasks on `pool`. On a channel failure every
    /// in-flight task releases its locks and every pending task is
    /// cancelled, so the next run starts clean.
    fn run_on_pool(&mut self, pool: WorkerPool, events: &Sender<RunEvent>) -> Result<RunSummary> {
        let start = Instant::now();
        let _ = events.send(RunEvent::Tasks(self.tasks.summaries()));

        let mut summary = RunSummary::default();
        let mut in_flight = HashMap::new();
        let outcome = self.drive(&pool, events, start, &mut in_flight, &mut summary);

        match outcome {
            Ok(false) => pool.shutdown(),
            Ok(true) => pool.abandon(),
            Err(ref e) => {
                tracing::error!("Run aborted: {}", e);
                pool.abandon();
                for (_, flight) in in_flight.drain() {
                    let mut task = flight.task;
                    if let Err(e) = task.finish_without_result(&mut self.trials) {
                        tracing::warn!("{}", e);
                    }
                    summary.failed += 1;
                }
                summary.cancelled += self.tasks.cancel_all(&mut self.trials).len();
            }
        }

        summary.elapsed = start.elapsed();
        tracing::info!(
            "Run finished in {:?}: {} completed, {} skipped, {} impossible, {} failed, {} cancelled",
            summary.elapsed,
            summary.completed,
            summary.skipped,
            summary.impossible,
            summary.failed,
            summary.cancelled
        );
        let _ = events.send(RunEvent::FinishedRun(summary.clone()));
        outcome.map(|_| summary)
    }

    /// Skip every pending task after a failure. Only the first failure
    /// cancels anything.
    fn fail_fast(&mut self, failed: &mut bool, summary: &mut RunSummary) {
        if !*failed {
            *failed = true;
            summary.cancelled += self.tasks.cancel_all(&mut self.trials).len();
        }
    }

    /// The scheduling loop. Returns `true` if the run ended by timeout with
    /// workers still busy.
    fn drive(
        &mut self,
        pool: &WorkerPool,
        events: &Sender<RunEvent>,
        start: Instant,
        in_flight: &mut HashMap<TaskId, InFlight>,
        summary: &mut RunSummary,
    ) -> Result<bool> {
        let timeout = self.config.workers.task_timeout();
        let mut failed = false;

        loop {
            let mut progressed = false;
            if !failed {
                let pulled = self.tasks.pull_runnable_tasks(&mut self.trials);
                progressed = pulled.made_progress();
                summary.skipped += pulled.skipped.len();
                summary.impossible += pulled.impossible.len();

                for id in pulled.runnable {
                    if failed {
                        break;
                    }
                    match self.tasks.checkout_task(id, &mut self.trials) {
                        Ok((task, run_info)) => {
                            tracing::debug!("Dispatching task {} ({})", id, task.plugin_name());
                            let _ = events.send(RunEvent::RunningTask(task.summary()));
                            in_flight.insert(
                                id,
                                InFlight {
                                    task,
                                    started: Instant::now(),
                                },
                            );
                            pool.submit(WorkItem { run_info })?;
                            let _ = events.send(RunEvent::DisplayGraph {
                                graph: self.tasks.dependency_graph(),
                                elapsed: start.elapsed(),
                            });
                        }
                        Err(e) => {
                            let removed = self.tasks.remove_tasks_where(|t| t.id() == id);
                            let plugin = removed
                                .first()
                                .map(|t| t.plugin_name().to_string())
                                .unwrap_or_default();
                            for mut task in removed {
                                if let Err(e) = task.skip(&mut self.trials) {
                                    tracing::warn!("{}", e);
                                }
                            }
                            summary.failed += 1;
                            emit_error(events, id, &plugin, e.to_string(), Duration::ZERO);
                            self.fail_fast(&mut failed, summary);
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                if self.tasks.is_empty() {
                    return Ok(false);
                }
                if !progressed {
                    let stuck = self.tasks.cancel_all(&mut self.trials);
                    tracing::warn!(
                        "{} task(s) can never become runnable (dependency cycle)",
                        stuck.len()
                    );
                    summary.impossible += stuck.len();
                    return Ok(false);
                }
                continue;
            }

            let received = match timeout {
                Some(limit) => match pool.recv_timeout(limit) {
                    Ok(received) => received,
                    Err(RecvTimeoutError::Timeout) => {
                        for (id, flight) in in_flight.drain() {
                            let mut task = flight.task;
                            emit_error(
                                events,
                                id,
                                task.plugin_name(),
                                format!("no result within {:?}", limit),
                                flight.started.elapsed(),
                            );
                            if let Err(e) = task.finish_without_result(&mut self.trials) {
                                tracing::warn!("{}", e);
                            }
                            summary.failed += 1;
                        }
                        self.fail_fast(&mut failed, summary);
                        return Ok(true);
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(PipelineError::ChannelRecv.into())
                    }
                },
                None => pool.recv()?,
            };

            let Some(flight) = in_flight.remove(&received.task_id) else {
                tracing::warn!("Result for unknown task {}", received.task_id);
                continue;
            };
            let mut task = flight.task;
            let outcome = match received.outcome {
                Ok(values) => task
                    .complete(values, &mut self.trials)
                    .map_err(|e| e.to_string()),
                Err(trace) => Err(trace),
            };

            match outcome {
                Ok(()) => {
                    summary.completed += 1;
                    tracing::debug!(
                        "Task {} ({}) finished in {:?}",
                        task.id(),
                        task.plugin_name(),
                        received.runtime
                    );
                    let _ = events.send(RunEvent::FinishedTask {
                        task_id: task.id(),
                        plugin: task.plugin_name().to_string(),
                        runtime: received.runtime,
                    });
                }
                Err(trace) => {
                    if let Err(e) = task.finish_without_result(&mut self.trials) {
                        tracing::warn!("{}", e);
                    }
                    summary.failed += 1;
                    emit_error(events, task.id(), task.plugin_name(), trace, received.runtime);
                    self.fail_fast(&mut failed, summary);
                }
            }
        }
    }

    /// Interpret files in parallel on at most `open_files_workers` threads.
    ///
    /// Results arrive in completion order. Nothing is added to the
    /// collection; see [`ProcessManager::add_opened`].
    pub fn open_files(
        &self,
        paths: Vec<PathBuf>,
        interpreter: Arc<dyn FileInterpreter>,
    ) -> Vec<OpenedFile> {
        if paths.is_empty() {
            return Vec::new();
        }
        let workers = self
            .config
            .workers
            .open_files_workers
            .max(1)
            .min(paths.len());

        let (path_tx, path_rx) = crossbeam_channel::unbounded::<PathBuf>();
        for path in paths {
            let _ = path_tx.send(path);
        }
        drop(path_tx);
        let (opened_tx, opened_rx) = crossbeam_channel::unbounded::<OpenedFile>();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let path_rx = path_rx.clone();
                let opened_tx = opened_tx.clone();
                let interpreter = Arc::clone(&interpreter);
                scope.spawn(move || {
                    for path in path_rx.iter() {
                        let result =
                            match panic::catch_unwind(AssertUnwindSafe(|| interpreter.interpret(&path))) {
                                Ok(Ok(items)) => Ok(items),
                                Ok(Err(e)) => Err(format!("{:?}", e)),
                                Err(_) => Err(format!("interpreter panicked on {}", path.display())),
                            };
                        if opened_tx.send(OpenedFile { path, result }).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(opened_tx);

        opened_rx.iter().collect()
    }

    /// Register opened trials and collect opened strategies.
    ///
    /// Trials without a path get the path of the file they came from.
    pub fn add_opened(&mut self, opened: Vec<OpenedFile>) -> (Vec<TrialId>, Vec<Strategy>) {
        let mut trial_ids = Vec::new();
        let mut strategies = Vec::new();

        for OpenedFile { path, result } in opened {
            match result {
                Ok(items) => {
                    for item in items {
                        match item {
                            Interpreted::Trial(trial) => {
                                let trial = if trial.fullpath().is_none() {
                                    trial.with_fullpath(&path)
                                } else {
                                    trial
                                };
                                trial_ids.push(self.trials.add(trial));
                            }
                            Interpreted::Strategy(strategy) => strategies.push(strategy),
                        }
                    }
                }
                Err(e) => tracing::warn!("Could not open {}: {}", path.display(), e),
            }
        }

        (trial_ids, strategies)
    }
}

/// A run executing on its own thread.
pub struct RunHandle {
    handle: JoinHandle<(ProcessManager, Result<RunSummary>)>,
}

impl RunHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run. The manager comes back even when the run failed.
    pub fn join(self) -> Result<(ProcessManager, Result<RunSummary>)> {
        self.handle
            .join()
            .map_err(|_| SpikepipeError::Thread("run thread panicked".to_string()))
    }
}
