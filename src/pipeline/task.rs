//! Tasks: one scheduled invocation of a plugin against specific trials.
//!
//! A task resolves its plugin's `requires`/`provides` names into concrete
//! [`ResourceRef`]s on its trials. Running a task follows the resource
//! protocol:
//!
//! 1. [`Task::get_run_info`] checks out every provided resource and reads
//!    (without locking) every required one, pooling across trials when the
//!    plugin asks for it.
//! 2. The plugin runs elsewhere on the snapshot.
//! 3. [`Task::complete`] splits pooled results back per trial and checks
//!    each provided resource in with the task's provenance.
//!
//! States only move forward:
//!
//! ```text
//! Pending ──► Ready ──► CheckedOut ──► Completed
//!    │          │
//!    └──────────┴──► Skipped
//! ```

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::events::TaskSummary;
use crate::pipeline::id::{TaskId, TrialId};
use crate::pipeline::pooling::{pack_pooled_resource, unpack_pooled_resource, PoolLayout};
use crate::plugin::{Plugin, Stage};
use crate::trial::{ChangeInfo, InputRef, ResourceRef, ResourceUpdate, TrialCollection};
use crate::types::{ResourceData, Settings};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Ready,
    CheckedOut,
    Completed,
    Skipped,
}

impl TaskState {
    /// Whether `next` is a forward move from this state.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, CheckedOut)
                | (Ready, CheckedOut)
                | (CheckedOut, Completed)
                | (Pending, Skipped)
                | (Ready, Skipped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Skipped)
    }
}

/// Everything a worker needs to run a task.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub task_id: TaskId,
    pub plugin: Arc<dyn Plugin>,
    /// One argument per required resource name, pooled for pooling plugins.
    pub args: Vec<ResourceData>,
    pub kwargs: Settings,
}

#[derive(Debug)]
pub struct Task {
    id: TaskId,
    stage: Stage,
    plugin: Arc<dyn Plugin>,
    trials: Vec<TrialId>,
    kwargs: Settings,
    requires: Vec<ResourceRef>,
    provides: Vec<ResourceRef>,
    state: TaskState,
    locking_keys: HashMap<ResourceRef, Uuid>,
    /// Pooling layout per required resource name, filled at checkout.
    layouts: HashMap<String, PoolLayout>,
    /// Provenance fixed at checkout, when the inputs were read.
    frozen_change: Option<ChangeInfo>,
}

impl Task {
    /// Build a task, creating any missing resources on its trials.
    pub fn new(
        plugin: Arc<dyn Plugin>,
        stage: Stage,
        trial_ids: Vec<TrialId>,
        kwargs: Settings,
        trials: &mut TrialCollection,
    ) -> PipelineResult<Self> {
        let info = plugin.info();
        if trial_ids.is_empty() {
            return Err(PipelineError::TaskCreation(format!(
                "plugin '{}' was given no trials",
                info.name
            )));
        }
        if !info.is_pooling && trial_ids.len() != 1 {
            return Err(PipelineError::TaskCreation(format!(
                "non-pooling plugin '{}' needs exactly one trial, got {}",
                info.name,
                trial_ids.len()
            )));
        }

        for &trial_id in &trial_ids {
            let trial = trials.try_get_mut(trial_id)?;
            for name in info.provides.iter().chain(info.requires.iter()) {
                trial.ensure_resource(name).map_err(|e| match e {
                    PipelineError::TaskCreation(msg) => PipelineError::TaskCreation(format!(
                        "plugin '{}' cannot use {}",
                        info.name, msg
                    )),
                    other => other,
                })?;
            }
        }

        let flatten = |names: &[String]| -> Vec<ResourceRef> {
            names
                .iter()
                .flat_map(|name| trial_ids.iter().map(move |&t| ResourceRef::new(t, name.clone())))
                .collect()
        };
        let requires = flatten(&info.requires);
        let provides = flatten(&info.provides);

        Ok(Self {
            id: TaskId::next(),
            stage,
            plugin: Arc::clone(&plugin),
            trials: trial_ids,
            kwargs,
            requires,
            provides,
            state: TaskState::Pending,
            locking_keys: HashMap::new(),
            layouts: HashMap::new(),
            frozen_change: None,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn plugin_name(&self) -> &str {
        self.plugin.name()
    }

    pub fn trials(&self) -> &[TrialId] {
        &self.trials
    }

    pub fn kwargs(&self) -> &Settings {
        &self.kwargs
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn requires(&self) -> &[ResourceRef] {
        &self.requires
    }

    pub fn provides(&self) -> &[ResourceRef] {
        &self.provides
    }

    /// Resources both read and written by this task.
    pub fn modifies(&self) -> Vec<&ResourceRef> {
        self.provides
            .iter()
            .filter(|r| self.requires.contains(r))
            .collect()
    }

    /// Resources written but not read by this task.
    pub fn originates(&self) -> Vec<&ResourceRef> {
        self.provides
            .iter()
            .filter(|r| !self.requires.contains(r))
            .collect()
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            plugin: self.plugin_name().to_string(),
            stage: self.stage,
            trials: self.trials.clone(),
        }
    }

    pub fn is_modifying(&self) -> bool {
        self.provides.iter().any(|r| self.requires.contains(r))
    }

    pub(crate) fn transition(&mut self, next: TaskState) -> PipelineResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::IllegalTransition {
                task: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Provenance a run of this task would record right now.
    ///
    /// Pure inputs are identified by their latest change. A resource this
    /// task rewrites in place is identified by the change its in-place chain
    /// started from, since its latest change may be this task's own output.
    pub fn change_info(&self, trials: &TrialCollection) -> ChangeInfo {
        let using = self
            .requires
            .iter()
            .map(|r| {
                let in_place = self.provides.contains(r);
                InputRef {
                    trial_id: r.trial,
                    resource: r.name.clone(),
                    change_id: trials.resource(r).ok().and_then(|res| {
                        if in_place {
                            res.base_change_id(r.trial)
                        } else {
                            res.latest_change_id()
                        }
                    }),
                }
            })
            .collect();
        let with = serde_json::Value::Object(
            self.kwargs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        ChangeInfo::new(self.plugin_name(), with, using)
    }

    /// False when every provided resource already records this exact
    /// computation. Stochastic plugins are always worth rerunning.
    pub fn would_generate_unique_results(&self, trials: &TrialCollection) -> bool {
        if self.plugin.info().is_stochastic || self.provides.is_empty() {
            return true;
        }
        let proposed = self.change_info(trials);
        self.provides.iter().any(|r| {
            !trials
                .resource(r)
                .map(|res| res.has_matching_change(&proposed))
                .unwrap_or(false)
        })
    }

    /// True iff nothing this task reads or writes is locked.
    pub fn is_ready(&self, trials: &TrialCollection) -> bool {
        self.requires
            .iter()
            .chain(self.provides.iter())
            .all(|r| trials.resource(r).map(|res| !res.is_locked()).unwrap_or(true))
    }

    /// Required resources that currently hold no data.
    pub fn missing_requirements(&self, trials: &TrialCollection) -> Vec<&ResourceRef> {
        self.requires
            .iter()
            .filter(|r| {
                trials
                    .resource(r)
                    .map(|res| res.data().is_none())
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Lock every provided resource and assemble the plugin arguments.
    ///
    /// On failure all locks taken here are released again.
    pub fn get_run_info(&mut self, trials: &mut TrialCollection) -> PipelineResult<RunInfo> {
        if !self.state.can_transition_to(TaskState::CheckedOut) {
            return Err(PipelineError::IllegalTransition {
                task: self.id,
                from: self.state,
                to: TaskState::CheckedOut,
            });
        }

        let proposed = self.change_info(trials);

        for r in self.provides.clone() {
            if self.locking_keys.contains_key(&r) {
                continue;
            }
            match trials.resource_mut(&r).and_then(|res| res.checkout()) {
                Ok(checkout) => {
                    self.locking_keys.insert(r, checkout.locking_key);
                }
                Err(e) => {
                    self.release_locks(trials);
                    return Err(e);
                }
            }
        }

        let args = match self.build_args(trials) {
            Ok(args) => args,
            Err(e) => {
                self.release_locks(trials);
                return Err(e);
            }
        };

        self.frozen_change = Some(proposed);
        self.transition(TaskState::CheckedOut)?;
        tracing::debug!(
            "Checked out task {} ({}, {} trial(s))",
            self.id,
            self.plugin_name(),
            self.trials.len()
        );

        Ok(RunInfo {
            task_id: self.id,
            plugin: Arc::clone(&self.plugin),
            args,
            kwargs: self.kwargs.clone(),
        })
    }

    fn build_args(&mut self, trials: &TrialCollection) -> PipelineResult<Vec<ResourceData>> {
        let info = self.plugin.info();
        let mut args = Vec::with_capacity(info.requires.len());
        self.layouts.clear();

        for name in &info.requires {
            let mut per_trial = Vec::with_capacity(self.trials.len());
            for &trial_id in &self.trials {
                let r = ResourceRef::new(trial_id, name.clone());
                let data = trials
                    .resource(&r)?
                    .data()
                    .cloned()
                    .ok_or_else(|| PipelineError::MissingData(r.to_string()))?;
                per_trial.push(data);
            }

            if info.is_pooling {
                let (pooled, layout) = pack_pooled_resource(&per_trial, info.silent_pooling)?;
                self.layouts.insert(name.clone(), layout);
                args.push(pooled);
            } else if let Some(data) = per_trial.pop() {
                args.push(data);
            }
        }
        Ok(args)
    }

    /// Write a plugin result back into the provided resources.
    ///
    /// The result is validated and split per trial before any resource is
    /// checked in, so a malformed result changes nothing.
    pub fn complete(
        &mut self,
        result: Vec<ResourceData>,
        trials: &mut TrialCollection,
    ) -> PipelineResult<()> {
        if self.state != TaskState::CheckedOut {
            return Err(PipelineError::IllegalTransition {
                task: self.id,
                from: self.state,
                to: TaskState::Completed,
            });
        }

        let plugin = Arc::clone(&self.plugin);
        let info = plugin.info();
        if result.len() != info.provides.len() {
            return Err(PipelineError::ResultMismatch(format!(
                "plugin '{}' returned {} value(s) for {} provided resource(s)",
                info.name,
                result.len(),
                info.provides.len()
            )));
        }

        let mut staged = Vec::with_capacity(result.len());
        for (index, (name, value)) in info.provides.iter().zip(result).enumerate() {
            let per_trial = if info.is_pooling {
                match info.unpool_source(index) {
                    Some(source) => {
                        let layout = self.layouts.get(source).ok_or_else(|| {
                            PipelineError::Pooling(format!(
                                "'{}' is unpooled as '{}', which is not a pooled input",
                                name, source
                            ))
                        })?;
                        unpack_pooled_resource(&value, layout)?
                    }
                    None => vec![value; self.trials.len()],
                }
            } else {
                vec![value]
            };

            if per_trial.len() != self.trials.len() {
                return Err(PipelineError::ResultMismatch(format!(
                    "'{}' split into {} part(s) for {} trial(s)",
                    name,
                    per_trial.len(),
                    self.trials.len()
                )));
            }
            staged.push((name, per_trial));
        }

        let change = self
            .frozen_change
            .clone()
            .unwrap_or_else(|| self.change_info(trials));

        for (name, per_trial) in staged {
            let preserve = info.modifies(name);
            for (&trial_id, data) in self.trials.iter().zip(per_trial) {
                let r = ResourceRef::new(trial_id, name.clone());
                let key = self.locking_keys.get(&r).copied();
                trials.resource_mut(&r)?.checkin(
                    Some(ResourceUpdate {
                        data,
                        change_info: change.clone(),
                    }),
                    key,
                    preserve,
                )?;
                self.locking_keys.remove(&r);
            }
        }

        self.release_locks(trials);
        self.transition(TaskState::Completed)
    }

    /// Release held locks without recording anything and mark skipped.
    pub fn skip(&mut self, trials: &mut TrialCollection) -> PipelineResult<()> {
        self.transition(TaskState::Skipped)?;
        self.release_locks(trials);
        Ok(())
    }

    /// Release held locks and mark completed with no result (worker failure).
    pub fn finish_without_result(&mut self, trials: &mut TrialCollection) -> PipelineResult<()> {
        self.release_locks(trials);
        self.transition(TaskState::Completed)
    }

    fn release_locks(&mut self, trials: &mut TrialCollection) {
        for (r, key) in self.locking_keys.drain() {
            let released = trials
                .resource_mut(&r)
                .and_then(|res| res.checkin(None, Some(key), false));
            if let Err(e) = released {
                tracing::warn!("Task {} could not release {}: {}", self.id, r, e);
            }
        }
    }
}
