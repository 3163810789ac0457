//! Pipeline-specific error types.

use crate::pipeline::id::{TaskId, TrialId};
use crate::pipeline::task::TaskState;
use thiserror::Error;

/// Errors that can occur within the scheduling system.
///
/// The resource-protocol variants (`ResourceLocked`, `ResourceNotLocked`,
/// `InvalidLockingKey`) always indicate a scheduling bug and are never
/// retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Resource '{0}' is already checked out")]
    ResourceLocked(String),

    #[error("Resource '{0}' is not checked out")]
    ResourceNotLocked(String),

    #[error("Invalid locking key for resource '{0}'")]
    InvalidLockingKey(String),

    #[error("Invalid change info for resource '{resource}': {message}")]
    InvalidChangeInfo { resource: String, message: String },

    #[error("Task creation failed: {0}")]
    TaskCreation(String),

    #[error("Dimensionality mismatch: {0}")]
    Dimensionality(String),

    #[error("Pooling error: {0}")]
    Pooling(String),

    #[error("No tasks to run")]
    NoTasks,

    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Unknown trial: {0}")]
    UnknownTrial(TrialId),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Trial {trial} has no resource named '{name}'")]
    UnknownResource { trial: TrialId, name: String },

    #[error("Required resource {0} has no data")]
    MissingData(String),

    #[error("Resource '{0}' is already bound on this trial")]
    DuplicateResource(String),

    #[error("Task {task} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("Plugin result mismatch: {0}")]
    ResultMismatch(String),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Channel receive error")]
    ChannelRecv,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
