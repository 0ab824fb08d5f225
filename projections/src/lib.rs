//! View maintenance for staffing events.
//!
//! # Overview
//!
//! Turns the partitioned booking and carer event logs into one projection
//! row per aggregate:
//!
//! ```text
//! EventLog ──▶ PartitionConsumer ──▶ ProjectionApplier ──▶ ViewStore
//!   (per partition)    │                    │
//!                      ▼                    ▼
//!               DeadLetterSink     OffsetStore + LagTracker
//! ```
//!
//! - [`consumer`]: ordered, pull-based reads of one partition, poison
//!   records dead-lettered
//! - [`applier`]: idempotent, gap-free folding with a bounded reorder buffer
//! - [`lag`]: applied vs. observed offsets, for read-your-writes checks
//! - [`worker`] and [`supervisor`]: one sequential worker per partition,
//!   all partitions in parallel, graceful shutdown
//! - [`postgres`]: `PostgreSQL` view and checkpoint storage
//!
//! # Delivery
//!
//! Records are delivered at least once. Checkpoints are committed only after
//! the rows they cover are written, and the applier treats anything at or
//! below a row's `last_applied_sequence` as a duplicate, so replays after a
//! crash or a [`rebuild`](supervisor::ViewMaintenance::rebuild) converge on
//! the same rows.

pub mod applier;
pub mod consumer;
pub mod lag;
pub mod postgres;
pub mod reorder;
pub mod supervisor;
pub mod worker;

pub use applier::{Applied, ApplierSettings, ApplyError, ApplyReport, ProjectionApplier};
pub use consumer::{ConsumerError, ConsumerSettings, PartitionConsumer, Polled};
pub use lag::{LagTracker, PartitionProgress};
pub use postgres::{PostgresOffsetStore, PostgresViewStore};
pub use supervisor::{PipelineSettings, RunOutcome, ViewMaintenance, all_partitions};
pub use worker::{PartitionWorker, PipelineHandles, WorkerError, WorkerReport};
