//! Error types for stage execution and the engine facade.
//!
//! Stage errors never cross the executor boundary: they are recorded on
//! the job and surfaced through status queries and events. Engine errors
//! are returned synchronously to the caller of an engine operation.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::ingest::IngestError;
use crate::models::JobId;
use crate::registry::RegistryError;

/// Failure of one generator invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// Temporary failure; the stage may be retried.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Permanent failure (e.g. invalid generator input).
    #[error("Fatal failure: {0}")]
    Fatal(String),

    /// The invocation exceeded its deadline.
    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The generator panicked.
    #[error("Generator panicked: {0}")]
    Panicked(String),
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Transient failures and timeouts are retried up to the ceiling.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Result type for generator invocations.
pub type GeneratorResult<T> = Result<T, StageError>;

/// Errors returned by [`JobEngine`](super::JobEngine) operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Job '{0}' not found")]
    JobNotFound(JobId),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Engine setup failed: {0}")]
    Setup(String),
}

impl EngineError {
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup(message.into())
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
