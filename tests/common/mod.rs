//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use crossbeam_channel::Receiver;
use spikepipe::{PipelineConfig, RunEvent};

/// Config with a small, fixed worker pool
pub fn test_config(max_workers: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.workers.max_workers = max_workers;
    config.workers.open_files_workers = 2;
    config
}

/// Drain every event already sent on `rx`
pub fn drain_events(rx: &Receiver<RunEvent>) -> Vec<RunEvent> {
    rx.try_iter().collect()
}

/// Number of `FinishedRun` events
pub fn finished_runs(events: &[RunEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RunEvent::FinishedRun(_)))
        .count()
}

/// Traces of every `TaskError` event
pub fn task_errors(events: &[RunEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TaskError { plugin, trace, .. } => Some((plugin.clone(), trace.clone())),
            _ => None,
        })
        .collect()
}

/// Plugin names of every `FinishedTask` event, in order
pub fn finished_plugins(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::FinishedTask { plugin, .. } => Some(plugin.clone()),
            _ => None,
        })
        .collect()
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
