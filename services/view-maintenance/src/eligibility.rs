//! Which carers may work which open bookings.
//!
//! Booking and carer rows share one view, told apart by shape: carer rows
//! carry `visa_status`, booking rows carry `required_qualifications`.
//!
//! A carer is eligible for a booking when
//! - the grades are equal,
//! - the carer holds every required qualification,
//! - the carer's visa status is `CITIZEN`, `PERMANENT_RESIDENT` or `WORK_VISA`,
//! - and the booking is still `OPEN`.

use crate::read_model::ReadModel;
use serde_json::Value;
use staffing_views_core::domain::VisaStatus;
use staffing_views_core::fold::{STATUS, status};
use staffing_views_core::projection::{ProjectionRow, StoreError, ViewFilter};
use thiserror::Error;

const GRADE: &str = "grade";
const LOCATION: &str = "location";
const QUALIFICATIONS: &str = "qualifications";
const REQUIRED_QUALIFICATIONS: &str = "required_qualifications";
const VISA_STATUS: &str = "visa_status";

const ACCEPTED_VISAS: [VisaStatus; 3] = [
    VisaStatus::Citizen,
    VisaStatus::PermanentResident,
    VisaStatus::WorkVisa,
];

/// Eligibility query errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EligibilityError {
    /// No live booking with this id
    #[error("Booking not found: {0}")]
    BookingNotFound(String),

    /// No live carer with this id
    #[error("Carer not found: {0}")]
    CarerNotFound(String),

    /// The view store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Optional narrowing of an eligibility query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EligibilityFilter {
    /// Only candidates at this location
    pub location: Option<String>,
    /// Only candidates of this grade
    pub grade: Option<String>,
}

impl EligibilityFilter {
    /// No narrowing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only candidates at `location`.
    #[must_use]
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Only candidates of `grade`.
    #[must_use]
    pub fn grade(mut self, grade: impl Into<String>) -> Self {
        self.grade = Some(grade.into());
        self
    }

    fn admits(&self, row: &ProjectionRow) -> bool {
        self.location
            .as_deref()
            .is_none_or(|location| row.field_str(LOCATION) == Some(location))
            && self
                .grade
                .as_deref()
                .is_none_or(|grade| row.field_str(GRADE) == Some(grade))
    }
}

fn is_carer(row: &ProjectionRow) -> bool {
    row.derived_fields.contains_key(VISA_STATUS)
}

fn is_booking(row: &ProjectionRow) -> bool {
    row.derived_fields.contains_key(REQUIRED_QUALIFICATIONS)
}

fn strings<'a>(row: &'a ProjectionRow, field: &str) -> Vec<&'a str> {
    row.derived_fields
        .get(field)
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn visa_accepted(carer: &ProjectionRow) -> bool {
    carer
        .field_str(VISA_STATUS)
        .is_some_and(|visa| ACCEPTED_VISAS.iter().any(|accepted| accepted.as_str() == visa))
}

/// Whether `carer` may work `booking`.
#[must_use]
pub fn is_eligible(carer: &ProjectionRow, booking: &ProjectionRow) -> bool {
    if carer.tombstoned || booking.tombstoned {
        return false;
    }
    if booking.field_str(STATUS) != Some(status::OPEN) {
        return false;
    }
    match (carer.field_str(GRADE), booking.field_str(GRADE)) {
        (Some(carer_grade), Some(booking_grade)) if carer_grade == booking_grade => {}
        _ => return false,
    }

    let held = strings(carer, QUALIFICATIONS);
    strings(booking, REQUIRED_QUALIFICATIONS)
        .iter()
        .all(|required| held.contains(required))
        && visa_accepted(carer)
}

/// Carers eligible for an open booking.
///
/// A booking that is no longer open has no eligible carers.
///
/// # Errors
///
/// Returns [`EligibilityError::BookingNotFound`] for an unknown or cancelled
/// booking and [`EligibilityError::Store`] if the view store fails.
pub async fn eligible_carers_for_booking(
    read_model: &ReadModel,
    booking_id: &str,
    filter: &EligibilityFilter,
) -> Result<Vec<ProjectionRow>, EligibilityError> {
    let booking = read_model
        .get(booking_id)
        .await?
        .filter(is_booking)
        .ok_or_else(|| EligibilityError::BookingNotFound(booking_id.to_string()))?;

    if booking.field_str(STATUS) != Some(status::OPEN) {
        tracing::debug!(booking_id, status = ?booking.field_str(STATUS), "Booking is not open");
        return Ok(Vec::new());
    }
    let Some(grade) = booking.field_str(GRADE) else {
        return Ok(Vec::new());
    };

    let candidates = read_model
        .query(ViewFilter::new().field_equals(GRADE, grade))
        .await?;

    Ok(candidates
        .into_iter()
        .filter(|row| is_carer(row) && filter.admits(row) && is_eligible(row, &booking))
        .collect())
}

/// Open bookings a carer is eligible for.
///
/// # Errors
///
/// Returns [`EligibilityError::CarerNotFound`] for an unknown carer and
/// [`EligibilityError::Store`] if the view store fails.
pub async fn eligible_bookings_for_carer(
    read_model: &ReadModel,
    carer_id: &str,
    filter: &EligibilityFilter,
) -> Result<Vec<ProjectionRow>, EligibilityError> {
    let carer = read_model
        .get(carer_id)
        .await?
        .filter(is_carer)
        .ok_or_else(|| EligibilityError::CarerNotFound(carer_id.to_string()))?;

    let Some(grade) = carer.field_str(GRADE) else {
        return Ok(Vec::new());
    };

    let candidates = read_model
        .query(
            ViewFilter::new()
                .field_equals(STATUS, status::OPEN)
                .field_equals(GRADE, grade),
        )
        .await?;

    Ok(candidates
        .into_iter()
        .filter(|row| is_booking(row) && filter.admits(row) && is_eligible(&carer, row))
        .collect())
}

/// Whether one carer may work one booking.
///
/// # Errors
///
/// Returns [`EligibilityError::CarerNotFound`] or
/// [`EligibilityError::BookingNotFound`] when either side is unknown, and
/// [`EligibilityError::Store`] if the view store fails.
pub async fn is_carer_eligible_for_booking(
    read_model: &ReadModel,
    carer_id: &str,
    booking_id: &str,
) -> Result<bool, EligibilityError> {
    let carer = read_model
        .get(carer_id)
        .await?
        .filter(is_carer)
        .ok_or_else(|| EligibilityError::CarerNotFound(carer_id.to_string()))?;
    let booking = read_model
        .get(booking_id)
        .await?
        .filter(is_booking)
        .ok_or_else(|| EligibilityError::BookingNotFound(booking_id.to_string()))?;

    Ok(is_eligible(&carer, &booking))
}

/// Number of carers eligible for a booking.
///
/// # Errors
///
/// Same as [`eligible_carers_for_booking`].
pub async fn count_eligible_carers_for_booking(
    read_model: &ReadModel,
    booking_id: &str,
) -> Result<usize, EligibilityError> {
    eligible_carers_for_booking(read_model, booking_id, &EligibilityFilter::new())
        .await
        .map(|carers| carers.len())
}

/// Number of open bookings a carer is eligible for.
///
/// # Errors
///
/// Same as [`eligible_bookings_for_carer`].
pub async fn count_eligible_bookings_for_carer(
    read_model: &ReadModel,
    carer_id: &str,
) -> Result<usize, EligibilityError> {
    eligible_bookings_for_carer(read_model, carer_id, &EligibilityFilter::new())
        .await
        .map(|bookings| bookings.len())
}
