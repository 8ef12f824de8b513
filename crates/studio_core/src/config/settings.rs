//! Settings struct with TOML-based sections.
//!
//! Settings are organized into logical sections that map to TOML tables.
//! Each section can be updated independently for atomic section-level updates.

use serde::{Deserialize, Serialize};

use crate::logging::LogLevel;
use crate::models::{ResourceClass, StageKind};

/// Root settings structure containing all configuration sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Where job records and logs live.
    #[serde(default)]
    pub paths: PathSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Change notification handling.
    #[serde(default)]
    pub ingest: IngestSettings,

    /// Concurrency slots and budget.
    #[serde(default)]
    pub admission: AdmissionSettings,

    /// Unit cost table.
    #[serde(default)]
    pub cost: CostSettings,

    /// Stage retry policy.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Event fan-out.
    #[serde(default)]
    pub events: EventSettings,
}

impl Settings {
    /// Check values that would make the engine unusable.
    pub fn validate(&self) -> Result<(), String> {
        for class in ResourceClass::ALL {
            if self.admission.slots_for(class) == 0 {
                return Err(format!("admission.{}_slots must be at least 1", class));
            }
        }
        if self.admission.per_source_slots == 0 {
            return Err("admission.per_source_slots must be at least 1".to_string());
        }
        if !self.admission.budget_ceiling.is_finite() || self.admission.budget_ceiling < 0.0 {
            return Err("admission.budget_ceiling must be a non-negative number".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.stage_timeout_secs == 0 {
            return Err("retry.stage_timeout_secs must be at least 1".to_string());
        }
        if self.events.subscriber_buffer == 0 {
            return Err("events.subscriber_buffer must be at least 1".to_string());
        }
        if self.cost.base_band < 0.0 || self.cost.widened_band < self.cost.base_band {
            return Err("cost.widened_band must be >= cost.base_band >= 0".to_string());
        }
        Ok(())
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Directory holding one JSON record per job.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Folder for per-job and application log files.
    #[serde(default = "default_logs_folder")]
    pub logs_folder: String,
}

fn default_data_dir() -> String {
    ".studio/jobs".to_string()
}

fn default_logs_folder() -> String {
    ".studio/logs".to_string()
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            logs_folder: default_logs_folder(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is not set.
    #[serde(default)]
    pub level: LogLevel,

    /// Use compact job logs (progress filtered, tail shown on error).
    #[serde(default = "default_true")]
    pub compact: bool,

    /// Progress step percentage for compact job logs.
    #[serde(default = "default_progress_step")]
    pub progress_step: u32,

    /// Number of recent lines replayed when a job fails.
    #[serde(default = "default_error_tail")]
    pub error_tail: u32,

    /// Write one log file per job.
    #[serde(default = "default_true")]
    pub job_logs: bool,
}

fn default_true() -> bool {
    true
}

fn default_progress_step() -> u32 {
    25
}

fn default_error_tail() -> u32 {
    20
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            compact: true,
            progress_step: default_progress_step(),
            error_tail: default_error_tail(),
            job_logs: true,
        }
    }
}

/// Change notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    /// Shared secret for signature verification.
    #[serde(default)]
    pub shared_secret: String,

    /// Environment variable that overrides `shared_secret` when set.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    /// Fields every row must carry.
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,

    /// Platforms used when a row does not list any.
    #[serde(default = "default_platforms")]
    pub default_platforms: Vec<String>,
}

fn default_secret_env() -> String {
    "STUDIO_WEBHOOK_SECRET".to_string()
}

fn default_required_fields() -> Vec<String> {
    vec![
        "title".to_string(),
        "description".to_string(),
        "audience".to_string(),
    ]
}

fn default_platforms() -> Vec<String> {
    vec!["youtube".to_string()]
}

impl IngestSettings {
    /// Secret to verify with: the environment override first, then the file.
    pub fn resolve_secret(&self) -> Option<String> {
        if !self.secret_env.is_empty() {
            if let Ok(value) = std::env::var(&self.secret_env) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        if self.shared_secret.is_empty() {
            None
        } else {
            Some(self.shared_secret.clone())
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            secret_env: default_secret_env(),
            required_fields: default_required_fields(),
            default_platforms: default_platforms(),
        }
    }
}

/// Admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSettings {
    /// Maximum reserved cost across all live jobs.
    #[serde(default = "default_budget_ceiling")]
    pub budget_ceiling: f64,

    /// Unit the budget and estimates are expressed in.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Slots for jobs whose heaviest stage is text-only.
    #[serde(default = "default_text_slots")]
    pub text_slots: usize,

    /// Slots for jobs whose heaviest stage is audio synthesis.
    #[serde(default = "default_audio_slots")]
    pub audio_slots: usize,

    /// Slots for jobs that render video.
    #[serde(default = "default_video_slots")]
    pub video_slots: usize,

    /// Live jobs allowed per change source.
    #[serde(default = "default_per_source_slots")]
    pub per_source_slots: usize,
}

fn default_budget_ceiling() -> f64 {
    500.0
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_text_slots() -> usize {
    16
}

fn default_audio_slots() -> usize {
    8
}

fn default_video_slots() -> usize {
    2
}

fn default_per_source_slots() -> usize {
    8
}

impl AdmissionSettings {
    /// Slot count configured for a resource class.
    pub fn slots_for(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::Text => self.text_slots,
            ResourceClass::Audio => self.audio_slots,
            ResourceClass::Video => self.video_slots,
        }
    }
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            budget_ceiling: default_budget_ceiling(),
            currency: default_currency(),
            text_slots: default_text_slots(),
            audio_slots: default_audio_slots(),
            video_slots: default_video_slots(),
            per_source_slots: default_per_source_slots(),
        }
    }
}

/// Additive unit cost table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSettings {
    #[serde(default = "default_script_cost")]
    pub script: f64,
    #[serde(default = "default_audio_cost")]
    pub audio: f64,
    #[serde(default = "default_video_cost")]
    pub video: f64,
    /// Base cost of the platform adaptation stage.
    #[serde(default = "default_platform_cost")]
    pub platform: f64,
    /// Extra cost per target platform.
    #[serde(default = "default_per_platform_cost")]
    pub per_platform: f64,

    /// Confidence band for requests inside the normal ranges.
    #[serde(default = "default_base_band")]
    pub base_band: f64,
    /// Confidence band once any input falls outside them.
    #[serde(default = "default_widened_band")]
    pub widened_band: f64,

    #[serde(default = "default_min_duration")]
    pub normal_min_duration_secs: u32,
    #[serde(default = "default_max_duration")]
    pub normal_max_duration_secs: u32,
    #[serde(default = "default_max_platforms")]
    pub normal_max_platforms: usize,
}

fn default_script_cost() -> f64 {
    0.05
}

fn default_audio_cost() -> f64 {
    0.40
}

fn default_video_cost() -> f64 {
    2.50
}

fn default_platform_cost() -> f64 {
    0.10
}

fn default_per_platform_cost() -> f64 {
    0.15
}

fn default_base_band() -> f64 {
    0.10
}

fn default_widened_band() -> f64 {
    0.35
}

fn default_min_duration() -> u32 {
    15
}

fn default_max_duration() -> u32 {
    180
}

fn default_max_platforms() -> usize {
    3
}

impl CostSettings {
    /// Unit cost of a stage.
    pub fn stage_cost(&self, stage: StageKind) -> f64 {
        match stage {
            StageKind::Script => self.script,
            StageKind::Audio => self.audio,
            StageKind::Video => self.video,
            StageKind::Platform => self.platform,
        }
    }
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            script: default_script_cost(),
            audio: default_audio_cost(),
            video: default_video_cost(),
            platform: default_platform_cost(),
            per_platform: default_per_platform_cost(),
            base_band: default_base_band(),
            widened_band: default_widened_band(),
            normal_min_duration_secs: default_min_duration(),
            normal_max_duration_secs: default_max_duration(),
            normal_max_platforms: default_max_platforms(),
        }
    }
}

/// Stage retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempt ceiling per stage (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles for each further one.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Deadline for a single generator invocation.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_stage_timeout_secs() -> u64 {
    300
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

/// Event fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Channel capacity per subscriber; events beyond it are dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_subscriber_buffer() -> usize {
    256
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Configuration sections for targeted updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Paths,
    Logging,
    Ingest,
    Admission,
    Cost,
    Retry,
    Events,
}

impl ConfigSection {
    pub const ALL: [ConfigSection; 7] = [
        ConfigSection::Paths,
        ConfigSection::Logging,
        ConfigSection::Ingest,
        ConfigSection::Admission,
        ConfigSection::Cost,
        ConfigSection::Retry,
        ConfigSection::Events,
    ];

    /// Get the TOML table name for this section.
    pub fn table_name(&self) -> &'static str {
        match self {
            ConfigSection::Paths => "paths",
            ConfigSection::Logging => "logging",
            ConfigSection::Ingest => "ingest",
            ConfigSection::Admission => "admission",
            ConfigSection::Cost => "cost",
            ConfigSection::Retry => "retry",
            ConfigSection::Events => "events",
        }
    }

    /// Comment written above the section.
    pub fn comment(&self) -> &'static str {
        match self {
            ConfigSection::Paths => "Job record and log locations",
            ConfigSection::Logging => "Logging configuration",
            ConfigSection::Ingest => "Change notification verification and row parsing",
            ConfigSection::Admission => "Concurrency slots and cost budget",
            ConfigSection::Cost => "Unit costs used by the estimator",
            ConfigSection::Retry => "Stage retry policy",
            ConfigSection::Events => "Event stream fan-out",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_serializes() {
        let settings = Settings::default();
        let toml = toml::to_string_pretty(&settings).unwrap();
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("[admission]"));
        assert!(toml.contains("budget_ceiling"));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let minimal = "[admission]\nvideo_slots = 1";
        let parsed: Settings = toml::from_str(minimal).unwrap();
        assert_eq!(parsed.admission.video_slots, 1);
        assert_eq!(parsed.admission.text_slots, 16);
        assert_eq!(parsed.retry.max_attempts, 3);
        assert!(parsed.logging.compact);
    }

    #[test]
    fn defaults_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn zero_slots_rejected() {
        let mut settings = Settings::default();
        settings.admission.video_slots = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.contains("video_slots"));
    }

    #[test]
    fn secret_falls_back_to_file_value() {
        let settings = IngestSettings {
            shared_secret: "from-file".to_string(),
            secret_env: "STUDIO_TEST_SECRET_THAT_IS_NEVER_SET".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.resolve_secret().as_deref(), Some("from-file"));

        let empty = IngestSettings {
            secret_env: String::new(),
            ..Default::default()
        };
        assert!(empty.resolve_secret().is_none());
    }
}
