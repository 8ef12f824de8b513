//! Error types for the job registry and stores.

use std::io;

use thiserror::Error;

use crate::models::{JobId, JobStatus};

/// Errors from registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Job '{0}' not found")]
    NotFound(JobId),

    #[error("Job '{0}' already exists")]
    AlreadyExists(JobId),

    /// Another live job already holds this idempotency key.
    #[error("Idempotency key already held by live job '{0}'")]
    DuplicateKey(JobId),

    /// Compare-and-swap lost: the job is no longer in the expected status.
    /// Re-read and re-evaluate before retrying.
    #[error("Status conflict on job '{job_id}': expected {expected}, found {actual}")]
    Conflict {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Job '{job_id}' is {status} and can no longer change")]
    Terminal { job_id: JobId, status: JobStatus },

    #[error("Invalid transition for job '{job_id}': {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    /// Whether the caller should re-read and re-evaluate.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors from job stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode job record '{job_id}': {source}")]
    Encode {
        job_id: JobId,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
