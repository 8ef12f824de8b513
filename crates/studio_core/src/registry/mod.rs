//! Job registry: the single source of truth for job state.
//!
//! This module provides:
//! - `JobRegistry`: in-memory job table with compare-and-swap status
//!   transitions, write-behind persistence and crash recovery
//! - `JobStore`: persistence trait with in-memory and JSON-file backends
//!
//! Allowed status transitions:
//!
//! ```text
//! queued ──► running ──► completed
//!   │           ├──────► failed
//!   │           └──────► cancelled
//!   ├──────────────────► cancelled
//!   └──────────────────► failed      (crash recovery only)
//! ```

mod errors;
mod registry;
mod store;
mod writer;

pub use errors::{RegistryError, RegistryResult, StoreError, StoreResult};
pub use registry::{JobRegistry, RegistrySnapshot};
pub use store::{JobStore, JsonFileStore, MemoryStore};
