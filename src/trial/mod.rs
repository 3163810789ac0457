//! Trials: one recording plus all resources derived from it.
//!
//! A [`Trial`] owns an explicit map from resource name to [`Resource`].
//! Trials are registered in a [`TrialCollection`], which owns the display
//! name allocator and hands out [`ResourceRef`]-based access to resources
//! for the scheduler.

pub mod names;
pub mod resource;

pub use names::DisplayNameAllocator;
pub use resource::{ChangeInfo, Checkout, InputRef, Resource, ResourceUpdate};

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::TrialId;
use crate::types::{Matrix, ResourceData};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Resource name of the raw voltage traces.
pub const RAW_TRACES: &str = "raw_traces";

/// Resource name of the raw sampling frequency.
pub const RAW_SAMPLING_FREQ: &str = "raw_sampling_freq";

/// Trial attributes that are not resources and can never be provided.
pub const READ_ONLY_ATTRIBUTES: &[&str] = &["id", "display_name", "fullpath", "marked"];

/// Address of one resource on one trial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub trial: TrialId,
    pub name: String,
}

impl ResourceRef {
    pub fn new(trial: TrialId, name: impl Into<String>) -> Self {
        Self {
            trial,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.trial, self.name)
    }
}

/// One recording session's raw data plus its derived resources.
#[derive(Debug, Clone)]
pub struct Trial {
    id: TrialId,
    display_name: String,
    fullpath: Option<PathBuf>,
    marked: bool,
    resources: BTreeMap<String, Resource>,
}

impl Trial {
    /// A trial with no resources.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: TrialId::new(),
            display_name: display_name.into(),
            fullpath: None,
            marked: true,
            resources: BTreeMap::new(),
        }
    }

    /// A trial built from raw traces (channels × samples).
    ///
    /// Each channel is shifted to zero mean.
    pub fn from_traces(
        display_name: impl Into<String>,
        mut traces: Matrix,
        sampling_freq: f64,
    ) -> Self {
        traces.center_rows();
        let mut trial = Self::new(display_name);
        trial
            .resources
            .insert(RAW_TRACES.to_string(), Resource::with_data(RAW_TRACES, traces.into()));
        trial.resources.insert(
            RAW_SAMPLING_FREQ.to_string(),
            Resource::with_data(RAW_SAMPLING_FREQ, ResourceData::Scalar(sampling_freq)),
        );
        trial
    }

    pub fn with_fullpath(mut self, path: impl Into<PathBuf>) -> Self {
        self.fullpath = Some(path.into());
        self
    }

    pub fn id(&self) -> TrialId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn fullpath(&self) -> Option<&Path> {
        self.fullpath.as_deref()
    }

    pub fn is_marked(&self) -> bool {
        self.marked
    }

    pub fn set_marked(&mut self, marked: bool) {
        self.marked = marked;
    }

    pub fn raw_traces(&self) -> Option<&Matrix> {
        self.resource(RAW_TRACES)
            .and_then(|r| r.data())
            .and_then(|d| d.as_matrix())
    }

    pub fn sampling_freq(&self) -> Option<f64> {
        self.resource(RAW_SAMPLING_FREQ)
            .and_then(|r| r.data())
            .and_then(|d| d.as_scalar())
    }

    pub fn is_read_only_attribute(name: &str) -> bool {
        READ_ONLY_ATTRIBUTES.contains(&name)
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn resource_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.get_mut(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Bind a resource under its own name.
    pub fn add_resource(&mut self, resource: Resource) -> PipelineResult<()> {
        let name = resource.name().to_string();
        if Self::is_read_only_attribute(&name) {
            return Err(PipelineError::TaskCreation(format!(
                "'{}' is a read-only attribute of trial '{}'",
                name, self.display_name
            )));
        }
        if self.resources.contains_key(&name) {
            return Err(PipelineError::DuplicateResource(name));
        }
        self.resources.insert(name, resource);
        Ok(())
    }

    /// Get the named resource, creating an empty one if missing.
    pub fn ensure_resource(&mut self, name: &str) -> PipelineResult<&mut Resource> {
        if Self::is_read_only_attribute(name) {
            return Err(PipelineError::TaskCreation(format!(
                "'{}' is a read-only attribute of trial '{}'",
                name, self.display_name
            )));
        }
        Ok(self
            .resources
            .entry(name.to_string())
            .or_insert_with(|| Resource::new(name)))
    }
}

/// The set of open trials plus their display-name allocator.
#[derive(Debug, Default)]
pub struct TrialCollection {
    trials: Vec<Trial>,
    names: DisplayNameAllocator,
}

impl TrialCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trial, giving it a unique display name.
    pub fn add(&mut self, mut trial: Trial) -> TrialId {
        trial.display_name = self.names.allocate(&trial.display_name);
        let id = trial.id;
        tracing::debug!("Added trial '{}' ({})", trial.display_name, id);
        self.trials.push(trial);
        id
    }

    /// Remove a trial and release its display name.
    pub fn remove(&mut self, id: TrialId) -> Option<Trial> {
        let idx = self.trials.iter().position(|t| t.id == id)?;
        let trial = self.trials.remove(idx);
        self.names.release(&trial.display_name);
        Some(trial)
    }

    /// Rename a trial. Returns the name actually assigned.
    pub fn rename(&mut self, id: TrialId, requested: &str) -> PipelineResult<String> {
        let idx = self
            .trials
            .iter()
            .position(|t| t.id == id)
            .ok_or(PipelineError::UnknownTrial(id))?;
        let old = std::mem::take(&mut self.trials[idx].display_name);
        self.names.release(&old);
        let name = self.names.allocate(requested);
        self.trials[idx].display_name = name.clone();
        Ok(name)
    }

    pub fn get(&self, id: TrialId) -> Option<&Trial> {
        self.trials.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: TrialId) -> Option<&mut Trial> {
        self.trials.iter_mut().find(|t| t.id == id)
    }

    pub fn try_get(&self, id: TrialId) -> PipelineResult<&Trial> {
        self.get(id).ok_or(PipelineError::UnknownTrial(id))
    }

    pub fn try_get_mut(&mut self, id: TrialId) -> PipelineResult<&mut Trial> {
        self.get_mut(id).ok_or(PipelineError::UnknownTrial(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trial> {
        self.trials.iter()
    }

    pub fn ids(&self) -> Vec<TrialId> {
        self.trials.iter().map(|t| t.id).collect()
    }

    pub fn marked_ids(&self) -> Vec<TrialId> {
        self.trials.iter().filter(|t| t.marked).map(|t| t.id).collect()
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn resource(&self, r: &ResourceRef) -> PipelineResult<&Resource> {
        self.try_get(r.trial)?
            .resource(&r.name)
            .ok_or_else(|| PipelineError::UnknownResource {
                trial: r.trial,
                name: r.name.clone(),
            })
    }

    pub fn resource_mut(&mut self, r: &ResourceRef) -> PipelineResult<&mut Resource> {
        self.try_get_mut(r.trial)?
            .resource_mut(&r.name)
            .ok_or_else(|| PipelineError::UnknownResource {
                trial: r.trial,
                name: r.name.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traces() -> Matrix {
        Matrix::from_rows(vec![vec![1.0, 2.0, 3.0], vec![5.0, 5.0, 5.0]]).unwrap()
    }

    #[test]
    fn test_from_traces_binds_raw_resources() {
        let trial = Trial::from_traces("rec", traces(), 30_000.0);
        assert_eq!(trial.sampling_freq(), Some(30_000.0));
        let raw = trial.raw_traces().unwrap();
        assert_eq!(raw.row(0).unwrap(), &[-1.0, 0.0, 1.0]);
        assert_eq!(raw.row(1).unwrap(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut trial = Trial::new("rec");
        trial.add_resource(Resource::new("df_traces")).unwrap();
        assert_eq!(
            trial.add_resource(Resource::new("df_traces")),
            Err(PipelineError::DuplicateResource("df_traces".to_string()))
        );
    }

    #[test]
    fn test_read_only_attributes_cannot_be_resources() {
        let mut trial = Trial::new("rec");
        assert!(matches!(
            trial.ensure_resource("display_name"),
            Err(PipelineError::TaskCreation(_))
        ));
        assert!(trial.ensure_resource("event_times").unwrap().data().is_none());
        // Second call returns the same slot.
        let id = trial.resource("event_times").unwrap().id();
        assert_eq!(trial.ensure_resource("event_times").unwrap().id(), id);
    }

    #[test]
    fn test_collection_allocates_unique_names() {
        let mut trials = TrialCollection::new();
        let a = trials.add(Trial::new("recording"));
        let b = trials.add(Trial::new("recording"));
        assert_eq!(trials.get(a).unwrap().display_name(), "recording");
        assert_eq!(trials.get(b).unwrap().display_name(), "recording(1)");

        trials.remove(a).unwrap();
        let c = trials.add(Trial::new("recording"));
        assert_eq!(trials.get(c).unwrap().display_name(), "recording");
    }

    #[test]
    fn test_rename_releases_old_name() {
        let mut trials = TrialCollection::new();
        let a = trials.add(Trial::new("one"));
        let b = trials.add(Trial::new("two"));
        assert_eq!(trials.rename(b, "one").unwrap(), "one(1)");
        assert_eq!(trials.rename(a, "three").unwrap(), "three");
        let c = trials.add(Trial::new("one"));
        assert_eq!(trials.get(c).unwrap().display_name(), "one");
    }

    #[test]
    fn test_resource_lookup_by_ref() {
        let mut trials = TrialCollection::new();
        let id = trials.add(Trial::from_traces("rec", traces(), 1000.0));
        assert!(trials.resource(&ResourceRef::new(id, RAW_TRACES)).is_ok());
        assert!(matches!(
            trials.resource(&ResourceRef::new(id, "nope")),
            Err(PipelineError::UnknownResource { .. })
        ));
        assert!(matches!(
            trials.resource(&ResourceRef::new(TrialId::new(), RAW_TRACES)),
            Err(PipelineError::UnknownTrial(_))
        ));
    }
}
