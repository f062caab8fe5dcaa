//! The canonical envelope wrapping every saga message.

use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

use crate::error::MalformedEvent;
use crate::events::SagaEvent;

/// An immutable saga message.
///
/// Serializes to a flat JSON object:
/// `{"eventId": "...", "timestamp": "...", "eventType": "OrderCreated", "orderId": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Globally unique, generated at creation, never reused.
    pub event_id: EventId,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// The typed payload, including its `eventType` discriminator.
    #[serde(flatten)]
    pub event: SagaEvent,
}

impl EventEnvelope {
    /// Wraps an event with a fresh id and the current time.
    pub fn new(event: SagaEvent) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp: Utc::now(),
            event,
        }
    }

    /// Shorthand for `self.event.event_type()`.
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    /// Serializes the envelope to its JSON wire form.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Serializes the envelope to bytes for publishing.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Outcome of decoding a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A known, schema-valid event.
    Event(EventEnvelope),

    /// A well-formed message of a type this build does not know; consumers
    /// acknowledge and skip it.
    Unrecognized { event_type: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Header {
    event_id: EventId,
    timestamp: DateTime<Utc>,
}

/// Decodes a message body into a typed envelope.
///
/// Unknown `eventType` values are not errors. Anything else that does not fit
/// the schema is reported as [`MalformedEvent`].
pub fn decode(body: &[u8]) -> Result<Decoded, MalformedEvent> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(MalformedEvent::InvalidJson)?;

    let object = value.as_object().ok_or(MalformedEvent::NotAnObject)?;
    let event_type = object
        .get("eventType")
        .and_then(serde_json::Value::as_str)
        .ok_or(MalformedEvent::MissingEventType)?
        .to_string();

    if !SagaEvent::is_known_type(&event_type) {
        return Ok(Decoded::Unrecognized { event_type });
    }

    let header: Header =
        serde_json::from_value(value.clone()).map_err(|source| MalformedEvent::Schema {
            event_type: event_type.clone(),
            source,
        })?;
    let event: SagaEvent =
        serde_json::from_value(value).map_err(|source| MalformedEvent::Schema {
            event_type: event_type.clone(),
            source,
        })?;
    event.validate()?;

    Ok(Decoded::Event(EventEnvelope {
        event_id: header.event_id,
        timestamp: header.timestamp,
        event,
    }))
}
