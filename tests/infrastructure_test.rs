//! Test to verify test infrastructure and file-based setup work correctly

mod common;

use common::builders::{pipeline_registry, pipeline_strategy, PluginBuilder, TrialBuilder};
use common::mock_helpers::create_event_channel;
use spikepipe::{PipelineConfig, Plugin, ProcessManager, ResourceData, Stage, Strategy};
use std::sync::atomic::Ordering;

#[test]
fn test_infrastructure_setup() {
    let trial = TrialBuilder::new("rec").channels(4).samples(10).build();
    let traces = trial.raw_traces().unwrap();
    assert_eq!(traces.rows(), 4);
    // Raw traces are centred per channel
    let mean: f64 = traces.row(0).unwrap().iter().sum::<f64>() / 10.0;
    common::assert_float_eq(mean, 0.0, 1e-9);
}

#[test]
fn test_plugin_builder_counts_calls() {
    let builder = PluginBuilder::new("echo", Stage::Auxiliary)
        .requires(&["raw_traces"])
        .provides(&["echo"]);
    let calls = builder.calls();
    let plugin = builder.passthrough();

    let out = plugin
        .run(&[ResourceData::Scalar(1.5)], &Default::default())
        .unwrap();
    assert_eq!(out, vec![ResourceData::Scalar(1.5)]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_run_from_files_on_disk() {
    let dir = tempfile::tempdir().unwrap();

    let config_path = dir.path().join("spikepipe.toml");
    let mut config = PipelineConfig::default();
    config.workers.max_workers = 2;
    config.save(&config_path).unwrap();

    let strategy_path = dir.path().join("default.toml");
    pipeline_strategy(2.0).save(&strategy_path).unwrap();

    let config = PipelineConfig::load(&config_path).unwrap();
    let strategy = Strategy::load(&strategy_path).unwrap();
    assert_eq!(strategy, pipeline_strategy(2.0));

    let mut manager = ProcessManager::new(pipeline_registry(), config);
    manager.add_trial(TrialBuilder::new("rec").build());
    let (tx, _rx) = create_event_channel();
    let summary = manager.run(&strategy, None, &tx).unwrap();
    assert_eq!(summary.completed, 5);
}

#[test]
fn test_float_comparison() {
    common::assert_float_eq(1.0, 1.0000001, 0.001);
}

#[test]
#[should_panic]
fn test_float_comparison_fails() {
    common::assert_float_eq(1.0, 2.0, 0.001);
}
