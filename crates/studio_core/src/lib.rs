//! Studio Core - job orchestration engine for content generation
//!
//! Turns signed change notifications from a spreadsheet-like source into
//! multi-stage content jobs (script → audio → video → platform), admits
//! them under concurrency and budget limits, drives them through their
//! stages with retries, and streams lifecycle events to subscribers.
//!
//! Generators, storage and notification delivery are pluggable; the
//! crate has no network or UI dependencies.

pub mod admission;
pub mod config;
pub mod cost;
pub mod events;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod registry;

pub use orchestrator::{ContentGenerator, GeneratorSet, JobEngine};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
