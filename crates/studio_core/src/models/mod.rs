//! Data models for the studio pipeline.
//!
//! This module contains the core data structures shared by every component:
//! - Enums for job/stage status, stage kinds and resource classes
//! - Inbound change notifications and their row deltas
//! - Job requests derived from validated rows
//! - Jobs and per-stage results tracked by the registry

mod change;
mod enums;
mod job;
mod request;

pub use change::{ChangeEvent, RawNotification, RowDelta};
pub use enums::{JobStatus, ResourceClass, StageKind, StageStatus};
pub use job::{Job, JobId, JobOutput, JobStatusView, StageOutputRef, StageResult};
pub use request::{idempotency_key, JobRequest};
