//! Decoding errors.

use thiserror::Error;

/// A message that cannot be turned into a saga event.
///
/// Malformed messages are never retried; consumers route them to the
/// dead-letter queue for inspection.
#[derive(Debug, Error)]
pub enum MalformedEvent {
    /// The body is not JSON at all.
    #[error("message is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The body is JSON but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,

    /// `eventType` is absent or not a string.
    #[error("message has no string eventType")]
    MissingEventType,

    /// A required field is missing or has the wrong type.
    #[error("{event_type} does not match its schema: {source}")]
    Schema {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// Fields are well-typed but violate a payload constraint.
    #[error("{event_type} is invalid: {reason}")]
    Constraint { event_type: String, reason: String },
}

impl MalformedEvent {
    pub(crate) fn constraint(event_type: &str, reason: impl Into<String>) -> Self {
        Self::Constraint {
            event_type: event_type.to_string(),
            reason: reason.into(),
        }
    }
}
