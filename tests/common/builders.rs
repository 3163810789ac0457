//! Test data builders for creating trials, plugins and registries

use spikepipe::{Matrix, Plugin, PluginInfo, PluginRegistry, ResourceData, Settings, Stage, Trial};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type RunFn = dyn Fn(&[ResourceData], &Settings) -> anyhow::Result<Vec<ResourceData>> + Send + Sync;

/// Builder for creating test Trials
pub struct TrialBuilder {
    name: String,
    channels: usize,
    samples: usize,
    sampling_freq: f64,
    marked: bool,
}

impl TrialBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            channels: 2,
            samples: 8,
            sampling_freq: 30_000.0,
            marked: true,
        }
    }

    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    pub fn sampling_freq(mut self, sampling_freq: f64) -> Self {
        self.sampling_freq = sampling_freq;
        self
    }

    pub fn unmarked(mut self) -> Self {
        self.marked = false;
        self
    }

    pub fn build(self) -> Trial {
        let values = (0..self.channels * self.samples)
            .map(|i| (i % self.samples) as f64)
            .collect();
        let traces = Matrix::new(self.channels, self.samples, values)
            .expect("channels * samples values");
        let mut trial = Trial::from_traces(self.name, traces, self.sampling_freq);
        trial.set_marked(self.marked);
        trial
    }
}

/// A plugin whose behaviour is a closure; counts its invocations.
pub struct ScriptedPlugin {
    info: PluginInfo,
    run: Box<RunFn>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl Plugin for ScriptedPlugin {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn run(&self, args: &[ResourceData], kwargs: &Settings) -> anyhow::Result<Vec<ResourceData>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        (self.run)(args, kwargs)
    }
}

/// Builder for ScriptedPlugin
pub struct PluginBuilder {
    info: PluginInfo,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl PluginBuilder {
    pub fn new(name: &str, stage: Stage) -> Self {
        Self {
            info: PluginInfo::new(name, stage),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn requires(mut self, names: &[&str]) -> Self {
        self.info = self.info.requires(names.iter().copied());
        self
    }

    pub fn provides(mut self, names: &[&str]) -> Self {
        self.info = self.info.provides(names.iter().copied());
        self
    }

    pub fn pooling(mut self, silent: bool, unpool_as: &[Option<&str>]) -> Self {
        self.info = self
            .info
            .pooling(silent, unpool_as.iter().map(|s| s.map(String::from)).collect());
        self
    }

    pub fn stochastic(mut self) -> Self {
        self.info = self.info.stochastic();
        self
    }

    pub fn runs_with(mut self, stage: Stage) -> Self {
        self.info = self.info.runs_with(stage);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared invocation counter
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn build<F>(self, run: F) -> Arc<dyn Plugin>
    where
        F: Fn(&[ResourceData], &Settings) -> anyhow::Result<Vec<ResourceData>>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(ScriptedPlugin {
            info: self.info,
            run: Box::new(run),
            delay: self.delay,
            calls: self.calls,
        })
    }

    /// Plugin that returns its first argument once per provided resource.
    pub fn passthrough(self) -> Arc<dyn Plugin> {
        let outputs = self.info.provides.len();
        self.build(move |args, _| {
            let first = args
                .first()
                .cloned()
                .unwrap_or(ResourceData::Scalar(0.0));
            Ok(vec![first; outputs])
        })
    }
}

/// Registry with a full five-stage pipeline:
///
/// - `butterworth`: raw_traces -> df_traces
/// - `threshold`: df_traces -> event_times (one event per channel, scaled by
///   the `threshold` setting)
/// - `bandpass`: raw_traces -> ef_traces
/// - `waveform`: ef_traces, event_times -> features
/// - `kmeans`: features (pooled, silent) -> clusters
pub fn pipeline_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();

    registry.register(
        PluginBuilder::new("butterworth", Stage::DetectionFilter)
            .requires(&["raw_traces"])
            .provides(&["df_traces"])
            .passthrough(),
    );
    registry.register(
        PluginBuilder::new("threshold", Stage::Detection)
            .requires(&["df_traces"])
            .provides(&["event_times"])
            .build(|args, kwargs| {
                let scale = kwargs
                    .get("threshold")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(1.0);
                let channels = args[0].as_matrix().map(|m| m.rows()).unwrap_or(0);
                Ok(vec![ResourceData::Vector(
                    (0..channels).map(|c| c as f64 * scale).collect(),
                )])
            }),
    );
    registry.register(
        PluginBuilder::new("bandpass", Stage::ExtractionFilter)
            .requires(&["raw_traces"])
            .provides(&["ef_traces"])
            .passthrough(),
    );
    registry.register(
        PluginBuilder::new("waveform", Stage::Extraction)
            .requires(&["ef_traces", "event_times"])
            .provides(&["features"])
            .build(|args, _| {
                let events = args[1]
                    .as_vector()
                    .ok_or_else(|| anyhow::anyhow!("event_times must be a vector"))?;
                Ok(vec![ResourceData::Vector(events.to_vec())])
            }),
    );
    registry.register(
        PluginBuilder::new("kmeans", Stage::Clustering)
            .requires(&["features"])
            .provides(&["clusters"])
            .pooling(true, &[Some("features")])
            .build(|args, _| {
                let features = args[0].as_vector().unwrap_or(&[]);
                Ok(vec![ResourceData::Vector(
                    features.iter().map(|f| if *f > 0.0 { 1.0 } else { 0.0 }).collect(),
                )])
            }),
    );

    registry
}

/// Strategy selecting every plugin of [`pipeline_registry`]
pub fn pipeline_strategy(threshold: f64) -> spikepipe::Strategy {
    let mut detection = Settings::new();
    detection.insert("threshold".to_string(), serde_json::json!(threshold));
    spikepipe::Strategy::new("default")
        .with_stage(Stage::DetectionFilter, "butterworth", Settings::new())
        .with_stage(Stage::Detection, "threshold", detection)
        .with_stage(Stage::ExtractionFilter, "bandpass", Settings::new())
        .with_stage(Stage::Extraction, "waveform", Settings::new())
        .with_stage(Stage::Clustering, "kmeans", Settings::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_builder() {
        let trial = TrialBuilder::new("rec").channels(3).samples(4).build();
        let traces = trial.raw_traces().unwrap();
        assert_eq!(traces.rows(), 3);
        assert_eq!(traces.cols(), 4);
        assert_eq!(trial.sampling_freq(), Some(30_000.0));
    }
}
