//! # Staffing Views Testing
//!
//! In-memory doubles and fixtures for the staffing view pipeline.
//!
//! This crate provides:
//! - [`InMemoryEventLog`]: partitioned log with fault injection
//! - [`InMemoryViewStore`] and [`InMemoryOffsetStore`]: compare-and-swap row
//!   storage and monotonic checkpoints
//! - [`InMemoryDeadLetterSink`]: captures dead letters for assertions
//! - [`FixedClock`]: deterministic, manually advanced time
//! - [`fixtures`]: booking and carer event builders
//!
//! ## Example
//!
//! ```
//! use staffing_views_core::projection::{ProjectionRow, UpsertOutcome, ViewStore};
//! use staffing_views_testing::InMemoryViewStore;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = InMemoryViewStore::new();
//! let row = ProjectionRow::new("A1", 0, serde_json::Map::new());
//!
//! assert_eq!(store.upsert(row.clone()).await.unwrap(), UpsertOutcome::Written);
//! assert_eq!(store.upsert(row).await.unwrap(), UpsertOutcome::Stale);
//! # });
//! ```

#![allow(clippy::unwrap_used)] // Lock poisoning only happens after a test already panicked
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Duration, Utc};
use staffing_views_core::environment::Clock;
use std::sync::RwLock;

mod dead_letter;
mod event_log;
mod stores;

pub mod fixtures;

pub use dead_letter::InMemoryDeadLetterSink;
pub use event_log::InMemoryEventLog;
pub use stores::{InMemoryOffsetStore, InMemoryViewStore};

/// Clock that only moves when told to.
///
/// # Example
///
/// ```
/// use staffing_views_core::environment::Clock;
/// use staffing_views_testing::test_clock;
///
/// let clock = test_clock();
/// let before = clock.now();
/// clock.advance(chrono::Duration::seconds(5));
/// assert_eq!(clock.now() - before, chrono::Duration::seconds(5));
/// ```
#[derive(Debug)]
pub struct FixedClock {
    time: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    /// Create a clock stopped at `time`.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: RwLock::new(time),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut time = self.time.write().unwrap();
        *time += by;
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.time.write().unwrap() = to;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.read().unwrap()
    }
}

/// A clock stopped at 2025-01-01 00:00:00 UTC.
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(fixtures::epoch())
}

/// Install a test-friendly tracing subscriber (idempotent).
///
/// Honours `RUST_LOG`; output is captured by the test harness.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
