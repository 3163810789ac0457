//! Error handling for spikepipe
//!
//! This module defines the crate-level error type and a Result alias.
//! Scheduler and resource-protocol failures live in
//! [`crate::pipeline::PipelineError`] and convert into [`SpikepipeError`].

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for spikepipe operations
#[derive(Error, Debug)]
pub enum SpikepipeError {
    /// Errors raised by the scheduler, tasks or resources
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to strategy files
    #[error("Strategy error: {0}")]
    Strategy(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A background run thread died
    #[error("Run thread error: {0}")]
    Thread(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<SpikepipeError>,
    },
}

impl SpikepipeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        SpikepipeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The pipeline error at the root of this error, if any.
    pub fn as_pipeline(&self) -> Option<&PipelineError> {
        match self {
            SpikepipeError::Pipeline(e) => Some(e),
            SpikepipeError::WithContext { source, .. } => source.as_pipeline(),
            _ => None,
        }
    }
}

/// Result type alias for spikepipe operations
pub type Result<T> = std::result::Result<T, SpikepipeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, PipelineError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| SpikepipeError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| SpikepipeError::from(e).with_context(f()))
    }
}
