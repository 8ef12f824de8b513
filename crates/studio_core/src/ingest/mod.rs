//! Change notification intake.
//!
//! Verifies inbound notifications from the change source, rejects replays
//! and turns each well-formed row into a [`JobRequest`](crate::models::JobRequest).
//!
//! Processing order for one notification:
//!
//! ```text
//! signature check ──► envelope parse ──► watermark advance ──► per-row parsing
//!   (Authentication)    (Malformed)       (DuplicateOrOutOfOrder)  (SchemaError, collected)
//! ```

mod errors;
mod signature;
mod validator;

pub use errors::{IngestError, IngestResult, SchemaError};
pub use signature::SignatureVerifier;
pub use validator::{ChangeValidator, ValidatedChange};
