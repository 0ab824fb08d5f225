//! Typed booking and carer events.
//!
//! The command services own these shapes; the view side only needs them to
//! build well-formed [`DomainEvent`] payloads (in producers, fixtures and
//! tests). Once on the wire every event is a JSON object payload and the
//! fold rules work on that.

use crate::codec::EncodeError;
use crate::event::{DomainEvent, EventType};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Carer visa status, as recorded by the carer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VisaStatus {
    /// Citizen
    Citizen,
    /// Permanent resident
    PermanentResident,
    /// Holder of a work visa
    WorkVisa,
    /// Holder of a student visa
    StudentVisa,
}

impl VisaStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Citizen => "CITIZEN",
            Self::PermanentResident => "PERMANENT_RESIDENT",
            Self::WorkVisa => "WORK_VISA",
            Self::StudentVisa => "STUDENT_VISA",
        }
    }
}

/// A field change record: `{"old": .., "new": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Value before the change
    pub old: serde_json::Value,
    /// Value after the change
    pub new: serde_json::Value,
}

impl FieldChange {
    /// Create a change record.
    pub fn new(old: impl Into<serde_json::Value>, new: impl Into<serde_json::Value>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }
}

/// A booking was opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingCreated {
    pub facility_id: Uuid,
    pub shift: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub grade: String,
    pub hourly_rate: f64,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_requirements: Option<String>,
    #[serde(default)]
    pub required_qualifications: Vec<String>,
}

/// Booking fields changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingModified {
    pub changed_fields: BTreeMap<String, FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_reason: Option<String>,
}

/// A carer was assigned to the booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingBooked {
    pub carer_id: String,
    pub booked_by: String,
}

/// The assigned carer pulled out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingPullout {
    pub carer_id: String,
    pub pullout_reason: String,
    pub pullout_by: String,
}

/// The booking was cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingCancelled {
    pub cancellation_reason: String,
    pub cancelled_by: String,
}

/// A carer registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCarer {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub location: String,
    pub grade: String,
    #[serde(default)]
    pub qualifications: Vec<String>,
    pub visa_status: VisaStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_travel_distance: Option<u32>,
}

/// Carer fields changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarerUpdated {
    pub changed_fields: BTreeMap<String, FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_reason: Option<String>,
}

/// One availability window of a carer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub available: bool,
}

/// The carer's availability slots were replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarerAvailabilityChanged {
    pub availability_slots: Vec<AvailabilitySlot>,
}

/// Events of the booking aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum BookingEvent {
    Created(BookingCreated),
    Modified(BookingModified),
    Booked(BookingBooked),
    Pullout(BookingPullout),
    Cancelled(BookingCancelled),
}

/// Events of the carer aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum CarerEvent {
    New(NewCarer),
    Updated(CarerUpdated),
    AvailabilityChanged(CarerAvailabilityChanged),
}

/// A typed event that can be put on the wire as a [`DomainEvent`].
pub trait TypedEvent {
    /// Event type of this value.
    fn event_type(&self) -> EventType;

    /// JSON object payload of this value.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Serialization`] if the value cannot be
    /// represented as JSON.
    fn payload(&self) -> Result<serde_json::Value, EncodeError>;

    /// Wrap this value in an envelope for `aggregate_id` at `sequence_number`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Serialization`] if the payload cannot be built.
    fn to_domain_event(
        &self,
        aggregate_id: impl Into<String>,
        sequence_number: u64,
    ) -> Result<DomainEvent, EncodeError> {
        Ok(DomainEvent::new(
            aggregate_id,
            sequence_number,
            self.event_type(),
            self.payload()?,
        ))
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<serde_json::Value, EncodeError> {
    serde_json::to_value(value).map_err(|e| EncodeError::Serialization(e.to_string()))
}

impl TypedEvent for BookingEvent {
    fn event_type(&self) -> EventType {
        match self {
            Self::Created(_) => EventType::BookingCreated,
            Self::Modified(_) => EventType::BookingModified,
            Self::Booked(_) => EventType::BookingBooked,
            Self::Pullout(_) => EventType::BookingPullout,
            Self::Cancelled(_) => EventType::BookingCancelled,
        }
    }

    fn payload(&self) -> Result<serde_json::Value, EncodeError> {
        match self {
            Self::Created(e) => to_payload(e),
            Self::Modified(e) => to_payload(e),
            Self::Booked(e) => to_payload(e),
            Self::Pullout(e) => to_payload(e),
            Self::Cancelled(e) => to_payload(e),
        }
    }
}

impl TypedEvent for CarerEvent {
    fn event_type(&self) -> EventType {
        match self {
            Self::New(_) => EventType::NewCarer,
            Self::Updated(_) => EventType::CarerUpdated,
            Self::AvailabilityChanged(_) => EventType::CarerAvailabilityChanged,
        }
    }

    fn payload(&self) -> Result<serde_json::Value, EncodeError> {
        match self {
            Self::New(e) => to_payload(e),
            Self::Updated(e) => to_payload(e),
            Self::AvailabilityChanged(e) => to_payload(e),
        }
    }
}
