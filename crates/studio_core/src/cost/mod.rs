//! Pre-admission cost estimation.
//!
//! Estimates are a pure function of the request and the configured unit
//! cost table, so admission can compute them inline.

mod estimator;

pub use estimator::{CostEstimate, CostEstimator};
