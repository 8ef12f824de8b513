//! Admission control.
//!
//! Every candidate job passes three checks before it is queued:
//!
//! 1. No live job already holds its idempotency key (`duplicate`)
//! 2. A slot is free for its resource class and its source (`over_capacity`)
//! 3. Its reserved cost fits under the budget ceiling (`budget_exceeded`)
//!
//! An accepted job keeps its slot until it reaches a terminal status.

mod controller;
mod slots;

pub use controller::{Admission, AdmissionController, AdmissionDecision, RejectReason};
pub use slots::{SlotGuard, SlotPools, SlotUsage};
