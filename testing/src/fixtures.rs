//! Booking and carer event builders.
//!
//! Every builder stamps `occurred_at` as `epoch() + sequence_number` seconds
//! so lag assertions can be exact.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use staffing_views_core::domain::{
    AvailabilitySlot, BookingBooked, BookingCancelled, BookingCreated, BookingEvent,
    BookingPullout, CarerAvailabilityChanged, CarerEvent, NewCarer, TypedEvent, VisaStatus,
};
use staffing_views_core::event::{DomainEvent, EventType};
use uuid::Uuid;

/// 2025-01-01 00:00:00 UTC.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

/// Timestamp fixtures use for `sequence_number`.
#[must_use]
pub fn occurred_at(sequence_number: u64) -> DateTime<Utc> {
    epoch() + Duration::seconds(i64::try_from(sequence_number).unwrap_or(i64::MAX))
}

/// A raw event with a deterministic timestamp.
#[must_use]
pub fn event(
    aggregate_id: &str,
    sequence_number: u64,
    event_type: EventType,
    payload: serde_json::Value,
) -> DomainEvent {
    DomainEvent::new(aggregate_id, sequence_number, event_type, payload)
        .with_occurred_at(occurred_at(sequence_number))
}

fn stamp(event: impl TypedEvent, aggregate_id: &str, sequence_number: u64) -> DomainEvent {
    event
        .to_domain_event(aggregate_id, sequence_number)
        .unwrap()
        .with_occurred_at(occurred_at(sequence_number))
}

/// `BookingCreated` at sequence 0.
#[must_use]
pub fn booking_created(booking_id: &str, grade: &str, location: &str, required: &[&str]) -> DomainEvent {
    let day = NaiveDate::from_ymd_opt(2025, 2, 3).unwrap();
    stamp(
        BookingEvent::Created(BookingCreated {
            facility_id: Uuid::nil(),
            shift: "DAY".to_string(),
            start_time: day.and_hms_opt(8, 0, 0).unwrap(),
            end_time: day.and_hms_opt(20, 0, 0).unwrap(),
            grade: grade.to_string(),
            hourly_rate: 32.5,
            location: location.to_string(),
            special_requirements: None,
            required_qualifications: required.iter().map(ToString::to_string).collect(),
        }),
        booking_id,
        0,
    )
}

/// `BookingBooked` at `sequence_number`.
#[must_use]
pub fn booking_booked(booking_id: &str, sequence_number: u64, carer_id: &str) -> DomainEvent {
    stamp(
        BookingEvent::Booked(BookingBooked {
            carer_id: carer_id.to_string(),
            booked_by: "scheduler".to_string(),
        }),
        booking_id,
        sequence_number,
    )
}

/// `BookingPullout` at `sequence_number`.
#[must_use]
pub fn booking_pullout(booking_id: &str, sequence_number: u64, carer_id: &str) -> DomainEvent {
    stamp(
        BookingEvent::Pullout(BookingPullout {
            carer_id: carer_id.to_string(),
            pullout_reason: "sickness".to_string(),
            pullout_by: carer_id.to_string(),
        }),
        booking_id,
        sequence_number,
    )
}

/// `BookingCancelled` at `sequence_number`.
#[must_use]
pub fn booking_cancelled(booking_id: &str, sequence_number: u64) -> DomainEvent {
    stamp(
        BookingEvent::Cancelled(BookingCancelled {
            cancellation_reason: "facility closed".to_string(),
            cancelled_by: "facility".to_string(),
        }),
        booking_id,
        sequence_number,
    )
}

/// `NewCarer` at sequence 0.
#[must_use]
pub fn new_carer(
    carer_id: &str,
    grade: &str,
    location: &str,
    qualifications: &[&str],
    visa_status: VisaStatus,
) -> DomainEvent {
    stamp(
        CarerEvent::New(NewCarer {
            first_name: "Test".to_string(),
            last_name: carer_id.to_string(),
            email: format!("{carer_id}@example.com"),
            phone: None,
            location: location.to_string(),
            grade: grade.to_string(),
            qualifications: qualifications.iter().map(ToString::to_string).collect(),
            visa_status,
            max_travel_distance: Some(30),
        }),
        carer_id,
        0,
    )
}

/// `CarerAvailabilityChanged` with one available slot on `day`.
#[must_use]
pub fn availability_changed(carer_id: &str, sequence_number: u64, day: NaiveDate) -> DomainEvent {
    stamp(
        CarerEvent::AvailabilityChanged(CarerAvailabilityChanged {
            availability_slots: vec![AvailabilitySlot {
                date: day,
                start_time: chrono::NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                end_time: chrono::NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
                available: true,
            }],
        }),
        carer_id,
        sequence_number,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_follow_sequence() {
        let booked = booking_booked("B1", 3, "C1");
        assert_eq!(booked.occurred_at, epoch() + Duration::seconds(3));
        assert_eq!(booked.event_type, EventType::BookingBooked);
    }

    #[test]
    fn created_booking_carries_required_qualifications() {
        let created = booking_created("B1", "RN", "Leeds", &["BLS", "PEWS"]);
        assert_eq!(created.sequence_number, 0);
        assert_eq!(created.payload["required_qualifications"], serde_json::json!(["BLS", "PEWS"]));
    }
}
