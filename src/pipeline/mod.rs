//! Dependency-driven task scheduling.
//!
//! Plugins declare which named resources they read and write. Tasks bind a
//! plugin to trials, the [`TaskManager`] decides what can run, and the
//! [`ProcessManager`] drives runs on a worker pool and reports progress as
//! [`RunEvent`]s over crossbeam channels.
//!
//! # Architecture
//!
//! ```text
//! [Strategy] ──► [ProcessManager] ──► [TaskManager] ──► [WorkerPool]
//!                       │                                    │
//!                       └──────── RunEvent channel ◄─────────┘
//! ```
//!
//! # Design
//!
//! - **Single-threaded scheduler**: only the scheduler touches trials and
//!   resources; workers get cloned snapshots.
//! - **Checkout/checkin**: a task locks every resource it writes for the
//!   duration of its run, and reads its inputs without locking.
//! - **Provenance**: each checkin records who computed the value, with which
//!   settings and from which inputs, so identical re-runs are skipped.
//! - **Fail fast**: the first failure cancels everything still pending.

pub mod error;
pub mod events;
pub mod id;
pub mod manager;
pub mod pooling;
pub mod process;
pub mod task;
pub mod worker;

pub use error::{PipelineError, PipelineResult};
pub use events::{GraphEdge, GraphNode, GraphSnapshot, RunEvent, RunSummary, TaskSummary};
pub use id::{ResourceId, TaskId, TrialId};
pub use manager::{PulledTasks, TaskManager};
pub use pooling::{pack_pooled_resource, unpack_pooled_resource, PoolLayout};
pub use process::{FileInterpreter, Interpreted, OpenedFile, ProcessManager, RunHandle};
pub use task::{RunInfo, Task, TaskState};
pub use worker::{WorkItem, WorkResult, WorkerPool};
