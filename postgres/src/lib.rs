//! `PostgreSQL` dead-letter queue for the staffing view pipeline.
//!
//! [`DeadLetterQueue`] implements
//! [`DeadLetterSink`](staffing_views_core::dead_letter::DeadLetterSink), so a
//! partition worker can park records it gave up on, and adds the triage
//! operations an operator needs: list, inspect, resolve, discard, count.
//!
//! # Example
//!
//! ```ignore
//! use staffing_views_postgres::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::new(pool);
//! dlq.migrate().await?;
//! println!("pending: {}", dlq.count_pending().await?);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter_queue;

pub use dead_letter_queue::{DeadLetterEntry, DeadLetterQueue};
