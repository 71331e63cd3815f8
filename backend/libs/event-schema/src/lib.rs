use chrono::{DateTime, Utc};
/// Event schemas for the chat message lifecycle topic
///
/// Every record on the topic is an `EventEnvelope<MessageEvent>`. The envelope
/// carries a required `schema_version` so producers and consumers can evolve
/// independently.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version for all events
pub const SCHEMA_VERSION: u32 = 1;

/// Namespace for deterministic event ids derived from message ids
const MESSAGE_EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_8a52_3e0d_4b7a_9c21_5d8e_f0a4_2b61);

/// Base event envelope for all Kafka messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope<T> {
    /// Unique event ID for idempotency and tracing
    pub event_id: Uuid,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Schema version for compatibility checking
    pub schema_version: u32,
    /// Source instance that generated the event
    pub source: String,
    /// Correlation ID for distributed tracing
    pub correlation_id: Option<Uuid>,
    /// Actual event payload
    pub data: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(source: impl Into<String>, data: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            correlation_id: None,
            data,
        }
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

pub type MessageEventEnvelope = EventEnvelope<MessageEvent>;

// ============================================================================
// MESSAGE LIFECYCLE EVENTS
// ============================================================================

/// Whether a delete hides the message for one viewer or removes it for everyone
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeleteScope {
    Me,
    All,
}

impl DeleteScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteScope::Me => "me",
            DeleteScope::All => "all",
        }
    }
}

impl std::str::FromStr for DeleteScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "me" => Ok(DeleteScope::Me),
            "all" => Ok(DeleteScope::All),
            other => Err(format!("unknown delete scope: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", content = "payload")]
pub enum MessageEvent {
    #[serde(rename = "message.new")]
    Created(MessageCreatedEvent),
    #[serde(rename = "message.edited")]
    Edited(MessageEditedEvent),
    #[serde(rename = "message.deleted")]
    Deleted(MessageDeletedEvent),
    #[serde(rename = "message.read")]
    Read(MessageReadEvent),
    #[serde(rename = "message.reaction")]
    Reaction(MessageReactionEvent),
}

impl MessageEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            MessageEvent::Created(_) => "message.new",
            MessageEvent::Edited(_) => "message.edited",
            MessageEvent::Deleted(_) => "message.deleted",
            MessageEvent::Read(_) => "message.read",
            MessageEvent::Reaction(_) => "message.reaction",
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            MessageEvent::Created(e) => &e.message_id,
            MessageEvent::Edited(e) => &e.message_id,
            MessageEvent::Deleted(e) => &e.message_id,
            MessageEvent::Read(e) => &e.message_id,
            MessageEvent::Reaction(e) => &e.message_id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            MessageEvent::Created(e) => &e.conversation_id,
            MessageEvent::Edited(e) => &e.conversation_id,
            MessageEvent::Deleted(e) => &e.conversation_id,
            MessageEvent::Read(e) => &e.conversation_id,
            MessageEvent::Reaction(e) => &e.conversation_id,
        }
    }

    /// Stable event id for `message.new`, so a re-published create is recognisably the same event.
    pub fn created_event_id(message_id: &str) -> Uuid {
        Uuid::new_v5(&MESSAGE_EVENT_NAMESPACE, message_id.as_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageCreatedEvent {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: String,
    /// Base64 of the at-rest ciphertext
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEditedEvent {
    pub message_id: String,
    pub conversation_id: String,
    /// Base64 of the replacement ciphertext
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDeletedEvent {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub scope: DeleteScope,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageReadEvent {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageReactionEvent {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub emoji: String,
    pub reacted_at: DateTime<Utc>,
}

// ============================================================================
// Version compatibility helpers
// ============================================================================

pub fn is_compatible(current_version: u32, message_version: u32) -> bool {
    // Exact match until a second schema version exists
    current_version == message_version
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_event() -> MessageEvent {
        MessageEvent::Read(MessageReadEvent {
            message_id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            user_id: "u2".to_string(),
            read_at: Utc::now(),
        })
    }

    #[test]
    fn test_event_envelope_creation() {
        let envelope = EventEnvelope::new("instance-a", read_event());
        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
        assert_eq!(envelope.source, "instance-a");
        assert!(envelope.correlation_id.is_none());
    }

    #[test]
    fn test_event_type_tag_on_the_wire() {
        let json = serde_json::to_value(EventEnvelope::new("a", read_event())).unwrap();
        assert_eq!(json["data"]["event_type"], "message.read");
        assert_eq!(json["data"]["payload"]["conversation_id"], "c1");
    }

    #[test]
    fn test_delete_scope_is_lowercase() {
        let event = MessageEvent::Deleted(MessageDeletedEvent {
            message_id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            user_id: "u1".to_string(),
            scope: DeleteScope::Me,
            deleted_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["scope"], "me");
        assert_eq!(event.event_type(), "message.deleted");
        assert_eq!("all".parse::<DeleteScope>(), Ok(DeleteScope::All));
        assert!("everyone".parse::<DeleteScope>().is_err());
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let raw = r#"{"event_type":"message.pinned","payload":{"message_id":"m1"}}"#;
        assert!(serde_json::from_str::<MessageEvent>(raw).is_err());
    }

    #[test]
    fn test_created_event_id_is_deterministic() {
        assert_eq!(
            MessageEvent::created_event_id("m1"),
            MessageEvent::created_event_id("m1")
        );
        assert_ne!(
            MessageEvent::created_event_id("m1"),
            MessageEvent::created_event_id("m2")
        );
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible(SCHEMA_VERSION, SCHEMA_VERSION));
        assert!(!is_compatible(1, 2));
    }
}
