//! Core enums used throughout the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted, waiting for the executor to claim it.
    #[default]
    Queued,
    /// Claimed by the executor; stages are being run.
    Running,
    /// All stages succeeded.
    Completed,
    /// A stage failed terminally (or the process restarted mid-run).
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Terminal statuses never change once committed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single stage within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Succeeded => write!(f, "succeeded"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Kind of content produced by a stage.
///
/// The declared order of the variants is the canonical pipeline order:
/// script text feeds audio synthesis, script and audio feed video
/// composition, and everything feeds per-platform adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Script,
    Audio,
    Video,
    Platform,
}

impl StageKind {
    /// Full pipeline in canonical order.
    pub const ALL: [StageKind; 4] = [
        StageKind::Script,
        StageKind::Audio,
        StageKind::Video,
        StageKind::Platform,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Platform => "platform",
        }
    }

    /// Resource class whose slots bound this stage.
    pub fn resource_class(&self) -> ResourceClass {
        match self {
            Self::Script | Self::Platform => ResourceClass::Text,
            Self::Audio => ResourceClass::Audio,
            Self::Video => ResourceClass::Video,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "script" => Ok(Self::Script),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "platform" => Ok(Self::Platform),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Capacity class a job draws its concurrency slot from.
///
/// Ordered from lightest to heaviest; a job is bound by the heaviest
/// class among its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Text,
    Audio,
    Video,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 3] = [
        ResourceClass::Text,
        ResourceClass::Audio,
        ResourceClass::Video,
    ];

    /// Heaviest class required by a set of stages (text when empty).
    pub fn for_stages(stages: &[StageKind]) -> Self {
        stages
            .iter()
            .map(StageKind::resource_class)
            .max()
            .unwrap_or(ResourceClass::Text)
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceClass::Text => write!(f, "text"),
            ResourceClass::Audio => write!(f, "audio"),
            ResourceClass::Video => write!(f, "video"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn stage_kind_parses_case_insensitive() {
        assert_eq!("Video".parse::<StageKind>().unwrap(), StageKind::Video);
        assert_eq!(" script ".parse::<StageKind>().unwrap(), StageKind::Script);
        assert!("thumbnail".parse::<StageKind>().is_err());
    }

    #[test]
    fn resource_class_is_heaviest_stage() {
        assert_eq!(
            ResourceClass::for_stages(&[StageKind::Script, StageKind::Platform]),
            ResourceClass::Text
        );
        assert_eq!(
            ResourceClass::for_stages(&[StageKind::Script, StageKind::Audio]),
            ResourceClass::Audio
        );
        assert_eq!(
            ResourceClass::for_stages(&StageKind::ALL),
            ResourceClass::Video
        );
        assert_eq!(ResourceClass::for_stages(&[]), ResourceClass::Text);
    }
}
