//! # Staffing Views Core
//!
//! Data model and seams of the staffing read side: the pipeline that turns
//! booking and carer events into a queryable view.
//!
//! ## Core Concepts
//!
//! - **`DomainEvent`**: an immutable fact about one aggregate, ordered by a
//!   per-aggregate, gapless sequence number
//! - **Envelope codec**: versioned wire form of a `DomainEvent`
//! - **Fold rules**: how each event type changes a row's derived fields
//! - **`ProjectionRow`**: the view of one aggregate, guarded by its last
//!   applied sequence
//! - **Seams**: `EventLog`, `ViewStore`, `OffsetStore` and `DeadLetterSink`
//!   traits, implemented in memory by the testing crate and for real by the
//!   postgres, projections and redpanda crates
//!
//! ## Data Flow
//!
//! ```text
//! command service ──append──► EventLog ──fetch──► worker ──fold──► ViewStore
//!                                                   │
//!                                                   └──commit──► OffsetStore
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Envelope codec (`encode` / `decode`).
pub mod codec;

/// Dead letters and their sink.
pub mod dead_letter;

/// Typed booking and carer events.
pub mod domain;

/// `DomainEvent` and event types.
pub mod event;

/// Partitioned event log abstraction.
pub mod event_log;

/// Per-event-type merge rules.
pub mod fold;

/// Partition identity and routing.
pub mod partition;

/// Projection rows, view store and offset store.
pub mod projection;

/// Injectable time source.
pub mod environment {
    use super::{DateTime, Utc};

    /// Clock trait for time-dependent operations (lag, reorder timeouts).
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
