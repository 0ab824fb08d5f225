//! Domain events as they travel from the command services to the view side.
//!
//! A [`DomainEvent`] is the unit the whole pipeline works with. Upstream
//! services (booking, carer) emit one per state change, the event log keeps
//! them in per-aggregate order, and the projection applier folds them into
//! one row per aggregate.
//!
//! # Ordering
//!
//! Within one `aggregate_id`, `sequence_number` starts at 0 and is strictly
//! increasing and gapless. The pipeline relies on this (it is produced
//! upstream) and detects violations instead of trusting them.
//!
//! # Example
//!
//! ```
//! use staffing_views_core::event::{DomainEvent, EventType};
//! use serde_json::json;
//!
//! let created = DomainEvent::new(
//!     "A1",
//!     0,
//!     EventType::BookingCreated,
//!     json!({ "status": "booked" }),
//! );
//!
//! assert_eq!(created.event_type.aggregate_type().topic(), "booking-events");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Envelope schema version written by this crate.
pub const SCHEMA_VERSION: u16 = 1;

/// Envelope schema versions this crate can decode.
pub const SUPPORTED_SCHEMA_VERSIONS: &[u16] = &[SCHEMA_VERSION];

/// Error returned when an event type name is not recognised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown event type: {0}")]
pub struct UnknownEventType(pub String);

/// The kind of aggregate an event belongs to.
///
/// Each aggregate type has its own topic, named `{aggregate-type}-events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateType {
    /// A booking (a shift to be staffed at a facility)
    Booking,
    /// A carer (a member of staff who can be booked)
    Carer,
}

impl AggregateType {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Booking => "booking",
            Self::Carer => "carer",
        }
    }

    /// Topic carrying this aggregate type's events.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("{}-events", self.as_str())
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every event type the view side understands.
///
/// The fold rule applied to a projection row is chosen by this value, see
/// [`crate::fold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A booking was opened
    BookingCreated,
    /// Booking fields changed
    BookingModified,
    /// A carer was assigned to the booking
    BookingBooked,
    /// The assigned carer pulled out; the booking is open again
    BookingPullout,
    /// The booking was cancelled (tombstone)
    BookingCancelled,
    /// A carer registered
    NewCarer,
    /// Carer fields changed
    CarerUpdated,
    /// The carer's availability slots were replaced
    CarerAvailabilityChanged,
}

impl EventType {
    /// All event types, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::BookingCreated,
        Self::BookingModified,
        Self::BookingBooked,
        Self::BookingPullout,
        Self::BookingCancelled,
        Self::NewCarer,
        Self::CarerUpdated,
        Self::CarerAvailabilityChanged,
    ];

    /// Stable wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BookingCreated => "BookingCreated",
            Self::BookingModified => "BookingModified",
            Self::BookingBooked => "BookingBooked",
            Self::BookingPullout => "BookingPullout",
            Self::BookingCancelled => "BookingCancelled",
            Self::NewCarer => "NewCarer",
            Self::CarerUpdated => "CarerUpdated",
            Self::CarerAvailabilityChanged => "CarerAvailabilityChanged",
        }
    }

    /// Aggregate type this event belongs to.
    #[must_use]
    pub const fn aggregate_type(&self) -> AggregateType {
        match self {
            Self::BookingCreated
            | Self::BookingModified
            | Self::BookingBooked
            | Self::BookingPullout
            | Self::BookingCancelled => AggregateType::Booking,
            Self::NewCarer | Self::CarerUpdated | Self::CarerAvailabilityChanged => {
                AggregateType::Carer
            }
        }
    }

    /// Whether this event creates its aggregate.
    #[must_use]
    pub const fn is_creation(&self) -> bool {
        matches!(self, Self::BookingCreated | Self::NewCarer)
    }

    /// Whether this event ends the aggregate's life (tombstone).
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        matches!(self, Self::BookingCancelled)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// An immutable fact emitted by a command service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Identifier of the aggregate (booking id, carer id)
    pub aggregate_id: String,

    /// Position of this event within its aggregate, starting at 0
    pub sequence_number: u64,

    /// What happened
    pub event_type: EventType,

    /// When the command service emitted the event
    pub occurred_at: DateTime<Utc>,

    /// Event body, a JSON object for every known event type
    pub payload: serde_json::Value,

    /// Envelope schema version the event was written with
    pub schema_version: u16,
}

impl DomainEvent {
    /// Create an event stamped with the current time and [`SCHEMA_VERSION`].
    #[must_use]
    pub fn new(
        aggregate_id: impl Into<String>,
        sequence_number: u64,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            sequence_number,
            event_type,
            occurred_at: Utc::now(),
            payload,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Override the emission timestamp.
    #[must_use]
    pub const fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Override the schema version (mostly useful to exercise the codec).
    #[must_use]
    pub const fn with_schema_version(mut self, schema_version: u16) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Topic this event is published to.
    #[must_use]
    pub fn topic(&self) -> String {
        self.event_type.aggregate_type().topic()
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {{ aggregate: {}, seq: {} }}",
            self.event_type, self.aggregate_id, self.sequence_number
        )
    }
}
