//! Per-event-type merge rules.
//!
//! [`fold`] is a pure function from (current derived fields, event) to the
//! next derived fields. Sequencing, deduplication and tombstone bookkeeping
//! are the applier's job; this module only knows what each event type means
//! for the shape of a row.

use crate::event::{DomainEvent, EventType};
use serde_json::{Map, Value};
use thiserror::Error;

/// Derived fields of a projection row.
pub type DerivedFields = Map<String, Value>;

/// Status field name shared by booking rows.
pub const STATUS: &str = "status";

/// Booking status values written by the fold rules.
pub mod status {
    /// Open for booking
    pub const OPEN: &str = "OPEN";
    /// A carer is assigned
    pub const BOOKED: &str = "BOOKED";
    /// Cancelled (tombstone)
    pub const CANCELLED: &str = "CANCELLED";
}

const CHANGED_FIELDS: &str = "changed_fields";
const AVAILABILITY_SLOTS: &str = "availability_slots";
const CARER_ID: &str = "carer_id";

/// The payload does not have the shape its event type requires.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {event_type} payload: {reason}")]
pub struct FoldError {
    /// Event type whose rule rejected the payload
    pub event_type: EventType,
    /// What was wrong
    pub reason: String,
}

impl FoldError {
    fn new(event_type: EventType, reason: impl Into<String>) -> Self {
        Self {
            event_type,
            reason: reason.into(),
        }
    }
}

/// Fold one event into the current derived fields.
///
/// `current` is `None` when the row does not exist yet.
///
/// # Errors
///
/// Returns [`FoldError`] if the payload is not a JSON object, or lacks a
/// field its event type cannot do without.
pub fn fold(current: Option<&DerivedFields>, event: &DomainEvent) -> Result<DerivedFields, FoldError> {
    let payload = event
        .payload
        .as_object()
        .ok_or_else(|| FoldError::new(event.event_type, "payload is not a JSON object"))?;

    let mut next = current.cloned().unwrap_or_default();

    match event.event_type {
        EventType::BookingCreated => {
            next = payload.clone();
            next.entry(STATUS)
                .or_insert_with(|| Value::from(status::OPEN));
        }
        EventType::NewCarer => {
            next = payload.clone();
        }
        EventType::BookingModified | EventType::CarerUpdated => {
            merge_changes(&mut next, payload, event.event_type)?;
        }
        EventType::BookingBooked => {
            next.extend(payload.clone());
            next.insert(STATUS.to_string(), Value::from(status::BOOKED));
        }
        EventType::BookingPullout => {
            next.extend(payload.clone());
            next.insert(STATUS.to_string(), Value::from(status::OPEN));
            next.remove(CARER_ID);
        }
        EventType::CarerAvailabilityChanged => {
            let slots = payload.get(AVAILABILITY_SLOTS).ok_or_else(|| {
                FoldError::new(event.event_type, "missing availability_slots")
            })?;
            next.insert(AVAILABILITY_SLOTS.to_string(), slots.clone());
        }
        EventType::BookingCancelled => {
            next = payload.clone();
            next.insert(STATUS.to_string(), Value::from(status::CANCELLED));
        }
    }

    Ok(next)
}

// `changed_fields` is flattened into the row; `{"old": .., "new": ..}`
// records resolve to their `new` value.
fn merge_changes(
    target: &mut DerivedFields,
    payload: &Map<String, Value>,
    event_type: EventType,
) -> Result<(), FoldError> {
    for (key, value) in payload {
        if key != CHANGED_FIELDS {
            target.insert(key.clone(), value.clone());
        }
    }

    match payload.get(CHANGED_FIELDS) {
        None | Some(Value::Null) => {}
        Some(Value::Object(changes)) => {
            for (field, change) in changes {
                let resolved = match change {
                    Value::Object(record) if record.contains_key("new") => {
                        record.get("new").cloned().unwrap_or(Value::Null)
                    }
                    other => other.clone(),
                };
                target.insert(field.clone(), resolved);
            }
        }
        Some(_) => {
            return Err(FoldError::new(event_type, "changed_fields is not an object"));
        }
    }

    Ok(())
}
