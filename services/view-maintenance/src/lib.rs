//! # Staffing View Maintenance
//!
//! Keeps the staffing read model in step with the booking and carer event
//! topics, and answers queries against it.
//!
//! - [`config`]: environment configuration
//! - [`read_model`]: row lookups and freshness checks for readers
//! - [`eligibility`]: carer/booking matching over the read model
//!
//! The `view-maintenance` binary wires these to `PostgreSQL` and Redpanda.

pub mod config;
pub mod eligibility;
pub mod read_model;

pub use config::{Config, ConfigError};
pub use eligibility::{
    EligibilityError, EligibilityFilter, count_eligible_bookings_for_carer,
    count_eligible_carers_for_booking, eligible_bookings_for_carer, eligible_carers_for_booking,
    is_carer_eligible_for_booking, is_eligible,
};
pub use read_model::ReadModel;
