//! Event envelope codec.
//!
//! Wire layout of an encoded [`DomainEvent`]:
//!
//! ```text
//! ┌────────────────────┬──────────────────────────────────────────────┐
//! │ schema_version u16 │ bincode body                                 │
//! │ (big endian)       │ aggregate_id, sequence_number, event_type,   │
//! │                    │ occurred_at, payload (JSON bytes)            │
//! └────────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The version header is read before anything else, so an envelope written
//! by a newer producer fails with [`DecodeError::SchemaMismatch`] rather than
//! as a confusing body error. The payload stays JSON inside the bincode body
//! because `serde_json::Value` is self-describing and bincode is not.

use crate::event::{DomainEvent, EventType, SUPPORTED_SCHEMA_VERSIONS, UnknownEventType};
use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const HEADER_LEN: usize = 2;

/// Errors from [`decode`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The envelope was written with a schema version this build cannot read.
    #[error("Unsupported schema version {found} (supported: {supported:?})")]
    SchemaMismatch {
        /// Version found in the header
        found: u16,
        /// Versions this build accepts
        supported: Vec<u16>,
    },

    /// The bytes are not a well-formed envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// Errors from [`encode`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The event carries a schema version this build does not write.
    #[error("Cannot encode unsupported schema version {0}")]
    UnsupportedVersion(u16),

    /// Body serialization failed.
    #[error("Failed to serialize envelope: {0}")]
    Serialization(String),
}

// Varint lengths, little endian, trailing bytes rejected.
fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
}

#[derive(Serialize, Deserialize)]
struct Body {
    aggregate_id: String,
    sequence_number: u64,
    event_type: String,
    occurred_at: DateTime<Utc>,
    payload: Vec<u8>,
}

/// Encode an event into its wire form.
///
/// # Errors
///
/// Returns [`EncodeError::UnsupportedVersion`] if the event's schema version
/// would not be readable by [`decode`], and [`EncodeError::Serialization`] if
/// the payload or body cannot be serialized.
pub fn encode(event: &DomainEvent) -> Result<Vec<u8>, EncodeError> {
    if !SUPPORTED_SCHEMA_VERSIONS.contains(&event.schema_version) {
        return Err(EncodeError::UnsupportedVersion(event.schema_version));
    }

    let payload = serde_json::to_vec(&event.payload)
        .map_err(|e| EncodeError::Serialization(e.to_string()))?;

    let body = Body {
        aggregate_id: event.aggregate_id.clone(),
        sequence_number: event.sequence_number,
        event_type: event.event_type.as_str().to_string(),
        occurred_at: event.occurred_at,
        payload,
    };

    let body = body_options()
        .serialize(&body)
        .map_err(|e| EncodeError::Serialization(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(&event.schema_version.to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Decode an event from its wire form.
///
/// # Errors
///
/// - [`DecodeError::SchemaMismatch`] if the header names an unsupported version
/// - [`DecodeError::Malformed`] if the buffer is truncated, the body is not
///   valid bincode, the payload is not valid JSON, the event type is unknown,
///   or bytes are left over after the body
pub fn decode(bytes: &[u8]) -> Result<DomainEvent, DecodeError> {
    let (header, body) = bytes
        .split_first_chunk::<HEADER_LEN>()
        .ok_or_else(|| DecodeError::Malformed(format!("envelope too short ({} bytes)", bytes.len())))?;

    let schema_version = u16::from_be_bytes(*header);
    if !SUPPORTED_SCHEMA_VERSIONS.contains(&schema_version) {
        return Err(DecodeError::SchemaMismatch {
            found: schema_version,
            supported: SUPPORTED_SCHEMA_VERSIONS.to_vec(),
        });
    }

    let body: Body = body_options()
        .deserialize(body)
        .map_err(|e| DecodeError::Malformed(format!("body: {e}")))?;

    let event_type: EventType = body
        .event_type
        .parse()
        .map_err(|e: UnknownEventType| DecodeError::Malformed(e.to_string()))?;

    let payload = serde_json::from_slice(&body.payload)
        .map_err(|e| DecodeError::Malformed(format!("payload: {e}")))?;

    Ok(DomainEvent {
        aggregate_id: body.aggregate_id,
        sequence_number: body.sequence_number,
        event_type,
        occurred_at: body.occurred_at,
        payload,
        schema_version,
    })
}
