//! Mock construction helpers

use crossbeam_channel::{unbounded, Receiver, Sender};
use mockall::mock;
use spikepipe::{FileInterpreter, Interpreted, RunEvent};
use std::path::Path;

mock! {
    pub Interpreter {}

    impl FileInterpreter for Interpreter {
        fn interpret(&self, path: &Path) -> anyhow::Result<Vec<Interpreted>>;
    }
}

/// Create an event channel for a run
pub fn create_event_channel() -> (Sender<RunEvent>, Receiver<RunEvent>) {
    unbounded()
}
