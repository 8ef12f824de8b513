//! Job orchestration: stage execution and the engine facade.
//!
//! # Architecture
//!
//! ```text
//! JobEngine
//!     ├── ChangeValidator      (ingest)
//!     ├── AdmissionController  (admission, cost)
//!     ├── JobRegistry          (registry)
//!     ├── EventBroadcaster     (events)
//!     └── StageExecutor ── GeneratorSet
//!             ├── script   generator
//!             ├── audio    generator
//!             ├── video    generator
//!             └── platform generator
//! ```
//!
//! Each admitted job runs on its own Tokio task. Stages of one job run
//! strictly in order; different jobs are not ordered relative to each other.

mod engine;
mod errors;
mod executor;
mod generator;
mod retry;

pub use engine::{EngineStats, IngestReport, JobEngine};
pub use errors::{EngineError, EngineResult, GeneratorResult, StageError};
pub use executor::{CancelHandle, JobLineCallback, StageExecutor};
pub use generator::{ContentGenerator, GeneratorSet, StageContext};
pub use retry::RetryPolicy;
