//! Job event stream.
//!
//! Delivery is at-most-once and best effort. The registry stays the
//! authoritative record of job state; events only mirror it.

mod broadcaster;
mod types;

pub use broadcaster::{BroadcastStats, EventBroadcaster, NotificationSink, Subscription};
pub use types::{JobEvent, JobEventKind};
