//! # spikepipe: scheduling and provenance for electrophysiology pipelines
//!
//! Recordings are loaded as [`Trial`]s and pushed through processing stages
//! (detection filter, detection, extraction filter, extraction, clustering,
//! plus auxiliary stages). Each stage is a [`Plugin`] that reads and writes
//! named resources on trials. The scheduler works out which plugins can run
//! from the resources they need, runs them on a worker pool, and records
//! where every result came from.
//!
//! ## Architecture
//!
//! - **Trials**: raw traces and derived resources, each resource guarded by
//!   a checkout/checkin lock and carrying its change history
//! - **Plugins**: external processing code behind the [`Plugin`] trait
//! - **Strategies**: which plugin and settings to use for each stage
//! - **Pipeline**: task construction, scheduling, worker pool and run events
//!
//! ## Configuration
//!
//! Worker and logging settings are read from `spikepipe.toml` in the
//! platform config directory (see [`config`]).
//!
//! ## Example
//!
//! ```ignore
//! use spikepipe::{PipelineConfig, PluginRegistry, ProcessManager, RunEvent, Strategy};
//!
//! let config = PipelineConfig::load_or_default();
//! let _guard = spikepipe::logging::init(&config.logging)?;
//!
//! let mut registry = PluginRegistry::new();
//! registry.register(my_filter_plugin());
//!
//! let mut manager = ProcessManager::new(registry, config);
//! manager.add_trial(trial);
//!
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let summary = manager.run(&Strategy::load("default.toml")?, None, &tx)?;
//! for event in rx.try_iter() {
//!     if let RunEvent::TaskError { plugin, trace, .. } = event {
//!         eprintln!("{plugin}: {trace}");
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod plugin;
pub mod strategy;
pub mod trial;
pub mod types;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{Result, SpikepipeError};
pub use pipeline::{
    FileInterpreter, Interpreted, OpenedFile, PipelineError, ProcessManager, RunEvent, RunHandle,
    RunSummary, TaskManager, TrialId,
};
pub use plugin::{Plugin, PluginInfo, PluginRegistry, Stage};
pub use strategy::Strategy;
pub use trial::{Resource, ResourceRef, Trial, TrialCollection};
pub use types::{Matrix, ResourceData, Settings};
