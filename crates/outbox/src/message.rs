use bus::Message;
use chrono::{DateTime, Utc};
use common::EventId;
use contracts::{EventEnvelope, SagaEvent};
use uuid::Uuid;

/// Header carrying the event type on published messages.
pub const EVENT_TYPE_HEADER: &str = "x-event-type";

/// Header naming the service that produced the event.
pub const SOURCE_HEADER: &str = "x-source";

/// A pending outgoing event, stored alongside the state change that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub event_id: EventId,
    pub event_type: String,
    /// The full envelope, exactly as it will be published.
    pub payload: serde_json::Value,
    pub exchange: String,
    pub routing_key: String,
    /// Messages sharing a partition key are published in creation order.
    pub partition_key: String,
    /// The owning service; each relay drains only its own rows.
    pub source: String,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Insertion order, assigned by the store.
    pub sequence: i64,
}

impl OutboxMessage {
    /// Builds the row for an envelope. The order id is the partition key.
    pub fn from_envelope(
        source: impl Into<String>,
        envelope: &EventEnvelope,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_id: envelope.event_id,
            event_type: envelope.event_type().to_string(),
            payload: envelope.to_json()?,
            exchange: contracts::SAGA_EXCHANGE.to_string(),
            routing_key: envelope.event.routing_key().to_string(),
            partition_key: envelope.event.order_id().to_string(),
            source: source.into(),
            is_processed: false,
            created_at: envelope.timestamp,
            processed_at: None,
            attempts: 0,
            last_error: None,
            sequence: 0,
        })
    }

    /// Wraps `event` in a fresh envelope and builds its row.
    pub fn for_event(source: impl Into<String>, event: SagaEvent) -> Result<Self, serde_json::Error> {
        Self::from_envelope(source, &EventEnvelope::new(event))
    }

    /// The bus message carrying the stored payload.
    pub fn to_bus_message(&self) -> Result<Message, serde_json::Error> {
        let body = serde_json::to_vec(&self.payload)?;
        Ok(Message::json(self.event_id.to_string(), body)
            .with_header(EVENT_TYPE_HEADER, self.event_type.clone())
            .with_header(SOURCE_HEADER, self.source.clone()))
    }
}
