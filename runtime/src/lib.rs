//! # Staffing Views Runtime
//!
//! Execution helpers shared by the pipeline crates. Currently this is retry
//! with exponential backoff, used for broker fetches and view-store writes.

/// Retry with exponential backoff.
pub mod retry;

pub use retry::{RetryError, RetryPolicy, retry_with_backoff, retry_with_predicate};
