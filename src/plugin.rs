//! Processing-stage plugins.
//!
//! Plugins are external collaborators: each declares the resource names it
//! reads and writes through a [`PluginInfo`] and exposes a `run` entry point.
//! Stage categories are a closed set ([`Stage`]).

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::types::{ResourceData, Settings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Processing stage a plugin belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DetectionFilter,
    Detection,
    ExtractionFilter,
    Extraction,
    Clustering,
    Auxiliary,
}

impl Stage {
    /// The main pipeline stages in execution order.
    pub const PIPELINE: [Stage; 5] = [
        Stage::DetectionFilter,
        Stage::Detection,
        Stage::ExtractionFilter,
        Stage::Extraction,
        Stage::Clustering,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DetectionFilter => "detection_filter",
            Stage::Detection => "detection",
            Stage::ExtractionFilter => "extraction_filter",
            Stage::Extraction => "extraction",
            Stage::Clustering => "clustering",
            Stage::Auxiliary => "auxiliary",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginInfo {
    pub name: String,
    pub stage: Stage,
    pub requires: Vec<String>,
    pub provides: Vec<String>,
    /// Runs once over all trials instead of once per trial.
    pub is_pooling: bool,
    /// Results differ between runs with identical inputs.
    pub is_stochastic: bool,
    /// Pooled inputs are concatenated rather than passed as a list.
    pub silent_pooling: bool,
    /// Per provided resource: name of the required resource whose pooling
    /// layout splits the result, or `None` to give every trial the whole
    /// result.
    pub unpool_as: Vec<Option<String>>,
    /// For auxiliary plugins, the stage they run alongside.
    pub runs_with_stage: Option<Stage>,
}

impl PluginInfo {
    pub fn new(name: impl Into<String>, stage: Stage) -> Self {
        Self {
            name: name.into(),
            stage,
            requires: Vec::new(),
            provides: Vec::new(),
            is_pooling: false,
            is_stochastic: false,
            silent_pooling: false,
            unpool_as: Vec::new(),
            runs_with_stage: None,
        }
    }

    pub fn requires<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn provides<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn pooling(mut self, silent: bool, unpool_as: Vec<Option<String>>) -> Self {
        self.is_pooling = true;
        self.silent_pooling = silent;
        self.unpool_as = unpool_as;
        self
    }

    pub fn stochastic(mut self) -> Self {
        self.is_stochastic = true;
        self
    }

    pub fn runs_with(mut self, stage: Stage) -> Self {
        self.runs_with_stage = Some(stage);
        self
    }

    /// Required resource whose layout splits provided result `index`.
    pub fn unpool_source(&self, index: usize) -> Option<&str> {
        self.unpool_as.get(index).and_then(|s| s.as_deref())
    }

    /// True if the resource is both read and written (in-place rewrite).
    pub fn modifies(&self, name: &str) -> bool {
        self.requires.iter().any(|r| r == name) && self.provides.iter().any(|p| p == name)
    }
}

/// A processing-stage implementation.
///
/// `run` receives one argument per `requires` entry (pooled across trials
/// for pooling plugins) and returns one value per `provides` entry.
pub trait Plugin: Send + Sync {
    fn info(&self) -> &PluginInfo;

    fn run(&self, args: &[ResourceData], kwargs: &Settings) -> anyhow::Result<Vec<ResourceData>>;

    fn name(&self) -> &str {
        &self.info().name
    }
}

impl fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Plugin({})", self.name())
    }
}

/// Plugins available to strategies, keyed by name.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, replacing any plugin with the same name.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Option<Arc<dyn Plugin>> {
        let name = plugin.name().to_string();
        tracing::debug!("Registered plugin '{}' ({})", name, plugin.info().stage);
        self.plugins.insert(name, plugin)
    }

    pub fn get(&self, name: &str) -> PipelineResult<Arc<dyn Plugin>> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownPlugin(name.to_string()))
    }

    /// All plugins of a stage, in name order.
    pub fn by_stage(&self, stage: Stage) -> Vec<Arc<dyn Plugin>> {
        self.plugins
            .values()
            .filter(|p| p.info().stage == stage)
            .cloned()
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
