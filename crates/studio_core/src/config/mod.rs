//! Configuration management for the studio pipeline.
//!
//! This module provides:
//! - TOML-based configuration with logical sections
//! - Atomic file writes (write to temp, then rename)
//! - Section-level updates (only changed section is modified)
//! - Validation on load with automatic defaults
//!
//! # Example
//!
//! ```no_run
//! use studio_core::config::{ConfigManager, ConfigSection};
//!
//! let mut config = ConfigManager::new(".config/studio.toml");
//! config.load_or_create().unwrap();
//!
//! println!("Budget: {}", config.settings().admission.budget_ceiling);
//!
//! config.settings_mut().admission.video_slots = 4;
//! config.update_section(ConfigSection::Admission).unwrap();
//! ```

mod manager;
mod settings;

pub use manager::{ConfigError, ConfigManager, ConfigResult};
pub use settings::{
    AdmissionSettings, ConfigSection, CostSettings, EventSettings, IngestSettings,
    LoggingSettings, PathSettings, RetrySettings, Settings,
};
