//! Lockable, provenance-tracked data slots.
//!
//! A [`Resource`] is only written through the checkout/checkin protocol:
//! `checkout` hands out a fresh locking key, and only the holder of that
//! key may check the resource back in. Every checkin that carries data
//! also carries a [`ChangeInfo`] describing who produced it, with which
//! settings, from which inputs.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{ResourceId, TrialId};
use crate::types::ResourceData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One input consumed by a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputRef {
    pub trial_id: TrialId,
    pub resource: String,
    /// Change id of the input at the time it was read.
    pub change_id: Option<Uuid>,
}

/// Provenance record of one change to a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeInfo {
    /// Name of the plugin that produced the value.
    pub by: String,
    /// Stamped on checkin.
    pub at: Option<DateTime<Utc>>,
    /// Settings used; must be a JSON object.
    pub with: serde_json::Value,
    pub using: Vec<InputRef>,
    /// Stamped on checkin.
    pub change_id: Option<Uuid>,
}

impl ChangeInfo {
    /// A proposed change, not yet stamped.
    pub fn new(by: impl Into<String>, with: serde_json::Value, using: Vec<InputRef>) -> Self {
        Self {
            by: by.into(),
            at: None,
            with,
            using,
            change_id: None,
        }
    }

    /// True if both describe the same computation (`by`, `with`, `using`).
    pub fn same_computation(&self, other: &ChangeInfo) -> bool {
        self.by == other.by && self.with == other.with && self.using == other.using
    }

    fn validate(&self, resource: &str) -> PipelineResult<()> {
        if self.by.trim().is_empty() {
            return Err(PipelineError::InvalidChangeInfo {
                resource: resource.to_string(),
                message: "'by' must name the producer".to_string(),
            });
        }
        if !self.with.is_object() {
            return Err(PipelineError::InvalidChangeInfo {
                resource: resource.to_string(),
                message: format!("'with' must be a mapping, got {}", self.with),
            });
        }
        Ok(())
    }
}

/// New data plus the provenance describing it.
#[derive(Debug, Clone)]
pub struct ResourceUpdate {
    pub data: ResourceData,
    pub change_info: ChangeInfo,
}

/// Snapshot returned by [`Resource::checkout`].
#[derive(Debug, Clone)]
pub struct Checkout {
    pub name: String,
    pub data: Option<ResourceData>,
    pub locking_key: Uuid,
}

/// A named unit of raw or derived data belonging to a trial.
#[derive(Debug, Clone)]
pub struct Resource {
    id: ResourceId,
    name: String,
    data: Option<ResourceData>,
    locking_key: Option<Uuid>,
    change_info: Vec<ChangeInfo>,
}

impl Resource {
    /// An empty, unlocked resource.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::next(),
            name: name.into(),
            data: None,
            locking_key: None,
            change_info: Vec::new(),
        }
    }

    pub fn with_data(name: impl Into<String>, data: ResourceData) -> Self {
        let mut resource = Self::new(name);
        resource.data = Some(data);
        resource
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> Option<&ResourceData> {
        self.data.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.locking_key.is_some()
    }

    /// Provenance history, oldest first.
    pub fn change_info(&self) -> &[ChangeInfo] {
        &self.change_info
    }

    /// Id of the most recent change, if any.
    pub fn latest_change_id(&self) -> Option<Uuid> {
        self.change_info.last().and_then(|c| c.change_id)
    }

    /// Id of the latest change that did not read this resource itself.
    ///
    /// In-place writers append to the history and list the resource among
    /// their own inputs, so this is the value an in-place chain started from.
    pub fn base_change_id(&self, trial: TrialId) -> Option<Uuid> {
        self.change_info
            .iter()
            .rev()
            .find(|c| {
                !c.using
                    .iter()
                    .any(|u| u.trial_id == trial && u.resource == self.name)
            })
            .and_then(|c| c.change_id)
    }

    /// True if any recorded change describes the same computation.
    pub fn has_matching_change(&self, proposed: &ChangeInfo) -> bool {
        self.change_info.iter().any(|c| c.same_computation(proposed))
    }

    /// Lock the resource and return a snapshot of its current data.
    pub fn checkout(&mut self) -> PipelineResult<Checkout> {
        if self.is_locked() {
            return Err(PipelineError::ResourceLocked(self.name.clone()));
        }
        let key = Uuid::new_v4();
        self.locking_key = Some(key);
        tracing::trace!("Checked out resource '{}' ({:?})", self.name, self.id);
        Ok(Checkout {
            name: self.name.clone(),
            data: self.data.clone(),
            locking_key: key,
        })
    }

    /// Unlock the resource, optionally committing new data.
    ///
    /// Validation failures leave the data, history and lock untouched.
    pub fn checkin(
        &mut self,
        update: Option<ResourceUpdate>,
        key: Option<Uuid>,
        preserve_provenance: bool,
    ) -> PipelineResult<()> {
        let held = self
            .locking_key
            .ok_or_else(|| PipelineError::ResourceNotLocked(self.name.clone()))?;
        if key != Some(held) {
            return Err(PipelineError::InvalidLockingKey(self.name.clone()));
        }

        if let Some(ResourceUpdate {
            data,
            mut change_info,
        }) = update
        {
            change_info.validate(&self.name)?;
            change_info.at = Some(Utc::now());
            change_info.change_id = Some(Uuid::new_v4());
            self.data = Some(data);
            if preserve_provenance {
                self.change_info.push(change_info);
            } else {
                self.change_info = vec![change_info];
            }
        }

        self.locking_key = None;
        Ok(())
    }

    /// Replace the data directly, bypassing provenance.
    pub fn manually_set_data(&mut self, data: Option<ResourceData>) -> PipelineResult<()> {
        if self.is_locked() {
            return Err(PipelineError::ResourceLocked(self.name.clone()));
        }
        self.data = data;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(by: &str, with: serde_json::Value, value: f64) -> ResourceUpdate {
        ResourceUpdate {
            data: ResourceData::Scalar(value),
            change_info: ChangeInfo::new(by, with, Vec::new()),
        }
    }

    #[test]
    fn test_double_checkout_fails() {
        let mut r = Resource::new("df_traces");
        r.checkout().unwrap();
        assert_eq!(
            r.checkout().unwrap_err(),
            PipelineError::ResourceLocked("df_traces".to_string())
        );
    }

    #[test]
    fn test_checkin_requires_lock_and_key() {
        let mut r = Resource::new("df_traces");
        assert!(matches!(
            r.checkin(None, None, false),
            Err(PipelineError::ResourceNotLocked(_))
        ));

        let co = r.checkout().unwrap();
        assert!(matches!(
            r.checkin(None, Some(Uuid::new_v4()), false),
            Err(PipelineError::InvalidLockingKey(_))
        ));
        assert!(matches!(
            r.checkin(None, None, false),
            Err(PipelineError::InvalidLockingKey(_))
        ));
        assert!(r.is_locked());

        r.checkin(None, Some(co.locking_key), false).unwrap();
        assert!(!r.is_locked());
        assert!(r.data().is_none());
    }

    #[test]
    fn test_stale_key_rejected_after_relock() {
        let mut r = Resource::new("event_times");
        let first = r.checkout().unwrap();
        r.checkin(None, Some(first.locking_key), false).unwrap();
        let _second = r.checkout().unwrap();
        assert!(matches!(
            r.checkin(None, Some(first.locking_key), false),
            Err(PipelineError::InvalidLockingKey(_))
        ));
    }

    #[test]
    fn test_checkin_stamps_provenance() {
        let mut r = Resource::new("features");
        let co = r.checkout().unwrap();
        r.checkin(
            Some(update("pca", json!({"n": 3}), 1.0)),
            Some(co.locking_key),
            false,
        )
        .unwrap();

        assert_eq!(r.data(), Some(&ResourceData::Scalar(1.0)));
        let history = r.change_info();
        assert_eq!(history.len(), 1);
        assert!(history[0].at.is_some());
        assert!(history[0].change_id.is_some());
        assert_eq!(r.latest_change_id(), history[0].change_id);
    }

    #[test]
    fn test_invalid_change_info_leaves_data_unchanged() {
        let mut r = Resource::with_data("features", ResourceData::Scalar(7.0));
        let co = r.checkout().unwrap();

        let err = r
            .checkin(Some(update("", json!({}), 1.0)), Some(co.locking_key), false)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChangeInfo { .. }));

        let err = r
            .checkin(
                Some(update("pca", json!([1, 2]), 1.0)),
                Some(co.locking_key),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChangeInfo { .. }));

        assert_eq!(r.data(), Some(&ResourceData::Scalar(7.0)));
        assert!(r.change_info().is_empty());
        assert!(r.is_locked());
    }

    #[test]
    fn test_preserve_provenance_appends_history() {
        let mut r = Resource::new("df_traces");
        for (i, by) in ["butterworth", "notch"].iter().enumerate() {
            let co = r.checkout().unwrap();
            r.checkin(
                Some(update(by, json!({}), i as f64)),
                Some(co.locking_key),
                i > 0,
            )
            .unwrap();
        }
        let names: Vec<_> = r.change_info().iter().map(|c| c.by.as_str()).collect();
        assert_eq!(names, vec!["butterworth", "notch"]);

        let co = r.checkout().unwrap();
        r.checkin(
            Some(update("bessel", json!({}), 9.0)),
            Some(co.locking_key),
            false,
        )
        .unwrap();
        assert_eq!(r.change_info().len(), 1);
    }

    #[test]
    fn test_base_change_id_skips_in_place_writes() {
        let trial = TrialId::new();
        let mut r = Resource::new("df_traces");
        assert_eq!(r.base_change_id(trial), None);

        let co = r.checkout().unwrap();
        r.checkin(Some(update("butterworth", json!({}), 1.0)), Some(co.locking_key), false)
            .unwrap();
        let origin = r.latest_change_id();

        let co = r.checkout().unwrap();
        let in_place = ChangeInfo::new(
            "notch",
            json!({}),
            vec![InputRef {
                trial_id: trial,
                resource: "df_traces".to_string(),
                change_id: origin,
            }],
        );
        r.checkin(
            Some(ResourceUpdate {
                data: ResourceData::Scalar(2.0),
                change_info: in_place,
            }),
            Some(co.locking_key),
            true,
        )
        .unwrap();

        assert_ne!(r.latest_change_id(), origin);
        assert_eq!(r.base_change_id(trial), origin);
        // Another trial's copy of the name is a plain input
        assert_eq!(r.base_change_id(TrialId::new()), r.latest_change_id());
    }

    #[test]
    fn test_manually_set_data_blocked_while_locked() {
        let mut r = Resource::new("clusters");
        let co = r.checkout().unwrap();
        assert!(r.manually_set_data(Some(ResourceData::Scalar(1.0))).is_err());
        r.checkin(None, Some(co.locking_key), false).unwrap();
        r.manually_set_data(Some(ResourceData::Scalar(1.0))).unwrap();
        assert_eq!(r.data(), Some(&ResourceData::Scalar(1.0)));
    }

    #[test]
    fn test_matching_change_ignores_stamps() {
        let mut r = Resource::new("features");
        let proposed = ChangeInfo::new("pca", json!({"n": 3}), Vec::new());
        let co = r.checkout().unwrap();
        r.checkin(
            Some(ResourceUpdate {
                data: ResourceData::Scalar(0.0),
                change_info: proposed.clone(),
            }),
            Some(co.locking_key),
            false,
        )
        .unwrap();
        assert!(r.has_matching_change(&proposed));
        assert!(!r.has_matching_change(&ChangeInfo::new("pca", json!({"n": 4}), Vec::new())));
    }
}
