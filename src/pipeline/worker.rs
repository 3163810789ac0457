//! Fixed-size pool of worker threads that execute plugin code.
//!
//! Work arrives on a bounded channel and results return on an unbounded one,
//! so a worker never blocks on a busy scheduler. Workers only ever see
//! cloned snapshots of resource data.

use crate::error::Result;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::TaskId;
use crate::pipeline::task::RunInfo;
use crate::types::ResourceData;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// One unit of work: run a checked-out task's plugin.
#[derive(Debug)]
pub struct WorkItem {
    pub run_info: RunInfo,
}

/// What came back from a worker.
#[derive(Debug)]
pub struct WorkResult {
    pub task_id: TaskId,
    /// Plugin output, or the rendered error chain / panic message.
    pub outcome: std::result::Result<Vec<ResourceData>, String>,
    pub runtime: Duration,
}

pub struct WorkerPool {
    work_tx: Option<Sender<WorkItem>>,
    result_rx: Receiver<WorkResult>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` worker threads (at least one).
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (work_tx, work_rx) = bounded::<WorkItem>(size);
        let (result_tx, result_rx) = unbounded::<WorkResult>();

        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("spikepipe-worker-{}", index))
                .spawn(move || worker_loop(work_rx, result_tx))?;
            handles.push(handle);
        }
        tracing::debug!("Started worker pool with {} thread(s)", size);

        Ok(Self {
            work_tx: Some(work_tx),
            result_rx,
            handles,
        })
    }

    /// A pool whose channels are already closed on the worker side.
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        let (work_tx, _) = bounded::<WorkItem>(1);
        let (_, result_rx) = unbounded::<WorkResult>();
        Self {
            work_tx: Some(work_tx),
            result_rx,
            handles: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn submit(&self, item: WorkItem) -> PipelineResult<()> {
        self.work_tx
            .as_ref()
            .ok_or(PipelineError::ChannelSend)?
            .send(item)
            .map_err(|_| PipelineError::ChannelSend)
    }

    /// Block until any worker reports back.
    pub fn recv(&self) -> PipelineResult<WorkResult> {
        self.result_rx.recv().map_err(|_| PipelineError::ChannelRecv)
    }

    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<WorkResult, RecvTimeoutError> {
        self.result_rx.recv_timeout(timeout)
    }

    /// Close the work queue and wait for every worker to exit.
    pub fn shutdown(mut self) {
        self.work_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked outside plugin code");
            }
        }
    }

    /// Close the work queue without waiting; busy workers finish in the
    /// background and their results are discarded.
    pub fn abandon(mut self) {
        self.work_tx.take();
        let detached = self.handles.drain(..).count();
        tracing::warn!("Abandoned worker pool with {} thread(s)", detached);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.work_tx.take();
    }
}

fn worker_loop(work_rx: Receiver<WorkItem>, result_tx: Sender<WorkResult>) {
    for WorkItem { run_info } in work_rx.iter() {
        let start = Instant::now();
        let RunInfo {
            task_id,
            plugin,
            args,
            kwargs,
        } = run_info;

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| plugin.run(&args, &kwargs))) {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(e)) => Err(format!("{:?}", e)),
            Err(payload) => Err(format!(
                "plugin '{}' panicked: {}",
                plugin.name(),
                panic_message(payload.as_ref())
            )),
        };

        let result = WorkResult {
            task_id,
            outcome,
            runtime: start.elapsed(),
        };
        if result_tx.send(result).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Plugin, PluginInfo, Stage};
    use crate::types::Settings;
    use anyhow::Context;
    use std::sync::Arc;

    enum Behaviour {
        Double,
        Fail,
        Panic,
    }

    struct TestPlugin {
        info: PluginInfo,
        behaviour: Behaviour,
    }

    impl Plugin for TestPlugin {
        fn info(&self) -> &PluginInfo {
            &self.info
        }

        fn run(&self, args: &[ResourceData], _kwargs: &Settings) -> anyhow::Result<Vec<ResourceData>> {
            match self.behaviour {
                Behaviour::Double => {
                    let x = args[0].as_scalar().context("expected a scalar")?;
                    Ok(vec![ResourceData::Scalar(x * 2.0)])
                }
                Behaviour::Fail => Err(anyhow::anyhow!("bad input")).context("filtering failed"),
                Behaviour::Panic => panic!("kaboom"),
            }
        }
    }

    fn item(behaviour: Behaviour) -> WorkItem {
        WorkItem {
            run_info: RunInfo {
                task_id: TaskId::next(),
                plugin: Arc::new(TestPlugin {
                    info: PluginInfo::new("test", Stage::Auxiliary),
                    behaviour,
                }),
                args: vec![ResourceData::Scalar(2.0)],
                kwargs: Settings::new(),
            },
        }
    }

    #[test]
    fn test_runs_plugin() {
        let pool = WorkerPool::new(2).unwrap();
        let work = item(Behaviour::Double);
        let id = work.run_info.task_id;
        pool.submit(work).unwrap();

        let result = pool.recv().unwrap();
        assert_eq!(result.task_id, id);
        assert_eq!(result.outcome, Ok(vec![ResourceData::Scalar(4.0)]));
        pool.shutdown();
    }

    #[test]
    fn test_error_chain_is_kept() {
        let pool = WorkerPool::new(1).unwrap();
        pool.submit(item(Behaviour::Fail)).unwrap();
        let trace = pool.recv().unwrap().outcome.unwrap_err();
        assert!(trace.contains("filtering failed"));
        assert!(trace.contains("bad input"));
        pool.shutdown();
    }

    #[test]
    fn test_panic_is_reported_not_fatal() {
        let pool = WorkerPool::new(1).unwrap();
        pool.submit(item(Behaviour::Panic)).unwrap();
        let trace = pool.recv().unwrap().outcome.unwrap_err();
        assert!(trace.contains("kaboom"));

        // The same worker keeps serving.
        pool.submit(item(Behaviour::Double)).unwrap();
        assert!(pool.recv().unwrap().outcome.is_ok());
        pool.shutdown();
    }

    #[test]
    fn test_recv_timeout_when_idle() {
        let pool = WorkerPool::new(1).unwrap();
        assert!(matches!(
            pool.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        ));
        pool.abandon();
    }
}
