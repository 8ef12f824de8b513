//! Jobs and per-stage results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{JobStatus, ResourceClass, StageKind, StageStatus};
use super::request::JobRequest;

/// Unique job identifier (UUID v4 string).
pub type JobId = String;

/// Outcome of one stage within a job.
///
/// Retry bookkeeping (attempt count and the earliest time the next attempt
/// may start) is stored here rather than in executor locals, so a persisted
/// record always shows where a stage's retry loop stood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub status: StageStatus,
    /// Number of invocations started so far.
    pub attempts: u32,
    /// Earliest time the next attempt may start (set while backing off).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Opaque reference to the generated content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    /// Last error seen for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageResult {
    pub fn pending(stage: StageKind) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            attempts: 0,
            next_eligible_at: None,
            output_ref: None,
            error: None,
        }
    }
}

/// One stage's output inside a job's result payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutputRef {
    pub stage: StageKind,
    pub output_ref: String,
}

/// Final result payload of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobOutput {
    /// Stage outputs in execution order.
    pub outputs: Vec<StageOutputRef>,
    /// Platforms the content was adapted for.
    pub platforms: Vec<String>,
}

impl JobOutput {
    /// Output reference produced by a stage.
    pub fn output_for(&self, stage: StageKind) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.stage == stage)
            .map(|o| o.output_ref.as_str())
    }
}

/// The durable unit of work tracked end-to-end.
///
/// Only the job registry writes jobs; everybody else works on clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub idempotency_key: String,
    pub source: String,
    pub row_key: String,
    pub title: String,
    pub status: JobStatus,
    /// Stage results in execution order.
    pub stages: Vec<StageResult>,
    /// Index of the stage being (or about to be) run.
    pub current_stage: usize,
    /// Progress percentage, 0–100. Never decreases.
    pub progress: u8,
    pub platforms: Vec<String>,
    pub resource_class: ResourceClass,
    /// Estimated cost widened by its confidence band, reserved against
    /// the budget while the job is live.
    pub reserved_cost: f64,
    /// Row fields passed to the generators.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Create a queued job for an admitted request.
    pub fn from_request(id: impl Into<JobId>, request: &JobRequest, reserved_cost: f64) -> Self {
        Self {
            id: id.into(),
            idempotency_key: request.idempotency_key.clone(),
            source: request.source.clone(),
            row_key: request.row_key.clone(),
            title: request.title.clone(),
            status: JobStatus::Queued,
            stages: request.stages.iter().copied().map(StageResult::pending).collect(),
            current_stage: 0,
            progress: 0,
            platforms: request.platforms.clone(),
            resource_class: request.resource_class(),
            reserved_cost,
            fields: request.fields.clone(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of stages that have succeeded.
    pub fn completed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Succeeded)
            .count()
    }

    /// Progress derived from stage results: `completed / total * 100`.
    pub fn computed_progress(&self) -> u8 {
        if self.stages.is_empty() {
            return 100;
        }
        ((self.completed_stages() * 100) / self.stages.len()) as u8
    }

    /// Stage the job is on, if it has not finished all of them.
    pub fn current_stage_kind(&self) -> Option<StageKind> {
        if self.status == JobStatus::Completed {
            return None;
        }
        self.stages.get(self.current_stage).map(|s| s.stage)
    }

    /// Collect every stage output into the final payload.
    pub fn assemble_output(&self) -> JobOutput {
        JobOutput {
            outputs: self
                .stages
                .iter()
                .filter_map(|s| {
                    s.output_ref.as_ref().map(|r| StageOutputRef {
                        stage: s.stage,
                        output_ref: r.clone(),
                    })
                })
                .collect(),
            platforms: self.platforms.clone(),
        }
    }

    /// Snapshot for the status query surface.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            current_stage: self.current_stage_kind(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// What a status poll returns for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
