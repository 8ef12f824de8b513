//! Job lifecycle events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::JobId;

/// What happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Admitted,
    StageStarted,
    StageCompleted,
    StageRetrying,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageRetrying => "stage_retrying",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this is the last event a job emits.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobEventKind,
    pub timestamp: DateTime<Utc>,
    /// Kind-specific detail (stage name, progress, error, ...).
    #[serde(default)]
    pub payload: Value,
}

impl JobEvent {
    pub fn new(job_id: impl Into<JobId>, kind: JobEventKind, payload: Value) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }
}
