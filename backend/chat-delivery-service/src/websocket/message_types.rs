//! Inbound client envelopes: `{"type": "...", "payload": {...}}`.

use crate::models::{DeleteScope, MessageKind};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum InboundError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

impl InboundError {
    /// Label for the rejected-inbound counter.
    pub fn reason(&self) -> &'static str {
        match self {
            InboundError::Malformed(_) => "malformed",
            InboundError::UnknownType(_) => "unknown_type",
            InboundError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendMessagePayload {
    pub content: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Client-chosen id; makes resends idempotent.
    #[serde(default, alias = "message_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypingPayload {
    #[serde(default = "default_true")]
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadPayload {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReactionPayload {
    pub message_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EditPayload {
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeletePayload {
    pub message_id: String,
    #[serde(default = "default_scope")]
    pub scope: DeleteScope,
}

fn default_true() -> bool {
    true
}

fn default_scope() -> DeleteScope {
    DeleteScope::Me
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEnvelope {
    Message(SendMessagePayload),
    Typing(TypingPayload),
    Read(ReadPayload),
    Reaction(ReactionPayload),
    /// Client heartbeat; refreshes presence.
    Presence,
    Edit(EditPayload),
    Delete(DeletePayload),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl InboundEnvelope {
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| InboundError::Malformed(e.to_string()))?;
        let payload = if raw.payload.is_null() {
            Value::Object(Default::default())
        } else {
            raw.payload
        };

        let envelope = match raw.kind.as_str() {
            "message" => InboundEnvelope::Message(decode("message", payload)?),
            "typing" => InboundEnvelope::Typing(decode("typing", payload)?),
            "read" => InboundEnvelope::Read(decode("read", payload)?),
            "reaction" => InboundEnvelope::Reaction(decode("reaction", payload)?),
            "presence" => InboundEnvelope::Presence,
            "edit" => InboundEnvelope::Edit(decode("edit", payload)?),
            "delete" => InboundEnvelope::Delete(decode("delete", payload)?),
            other => return Err(InboundError::UnknownType(other.to_string())),
        };
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEnvelope::Message(_) => "message",
            InboundEnvelope::Typing(_) => "typing",
            InboundEnvelope::Read(_) => "read",
            InboundEnvelope::Reaction(_) => "reaction",
            InboundEnvelope::Presence => "presence",
            InboundEnvelope::Edit(_) => "edit",
            InboundEnvelope::Delete(_) => "delete",
        }
    }

    fn validate(&self) -> Result<(), InboundError> {
        let invalid = |reason: &str| InboundError::InvalidPayload {
            kind: self.kind(),
            reason: reason.to_string(),
        };
        match self {
            InboundEnvelope::Message(p) => {
                if p.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
                    return Err(invalid("id must not be blank"));
                }
            }
            InboundEnvelope::Read(ReadPayload { message_id })
            | InboundEnvelope::Edit(EditPayload { message_id, .. })
            | InboundEnvelope::Delete(DeletePayload { message_id, .. }) => {
                if message_id.trim().is_empty() {
                    return Err(invalid("message_id is required"));
                }
            }
            InboundEnvelope::Reaction(p) => {
                if p.message_id.trim().is_empty() {
                    return Err(invalid("message_id is required"));
                }
                if p.emoji.trim().is_empty() {
                    return Err(invalid("emoji is required"));
                }
            }
            InboundEnvelope::Typing(_) | InboundEnvelope::Presence => {}
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(kind: &'static str, payload: Value) -> Result<T, InboundError> {
    serde_json::from_value(payload).map_err(|e| InboundError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_with_optional_fields() {
        let env = InboundEnvelope::parse(
            r#"{"type":"message",
                "payload":{"content":"hi","id":"m1","kind":"image","conversation_id":"c2"}}"#,
        )
        .unwrap();
        match env {
            InboundEnvelope::Message(p) => {
                assert_eq!(p.content, "hi");
                assert_eq!(p.id.as_deref(), Some("m1"));
                assert_eq!(p.kind, Some(MessageKind::Image));
                assert_eq!(p.conversation_id.as_deref(), Some("c2"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn typing_defaults_to_true_and_payload_may_be_missing() {
        assert_eq!(
            InboundEnvelope::parse(r#"{"type":"typing"}"#).unwrap(),
            InboundEnvelope::Typing(TypingPayload { is_typing: true })
        );
        assert_eq!(
            InboundEnvelope::parse(r#"{"type":"typing","payload":{"is_typing":false}}"#).unwrap(),
            InboundEnvelope::Typing(TypingPayload { is_typing: false })
        );
        assert_eq!(
            InboundEnvelope::parse(r#"{"type":"presence","payload":null}"#).unwrap(),
            InboundEnvelope::Presence
        );
    }

    #[test]
    fn delete_scope_defaults_to_me() {
        let env = InboundEnvelope::parse(r#"{"type":"delete","payload":{"message_id":"m1"}}"#);
        match env.unwrap() {
            InboundEnvelope::Delete(p) => assert_eq!(p.scope, DeleteScope::Me),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(InboundEnvelope::parse("not json").unwrap_err().reason(), "malformed");
        assert_eq!(
            InboundEnvelope::parse(r#"{"type":"dance"}"#).unwrap_err(),
            InboundError::UnknownType("dance".into())
        );
        assert_eq!(
            InboundEnvelope::parse(r#"{"type":"read","payload":{}}"#)
                .unwrap_err()
                .reason(),
            "invalid_payload"
        );
        assert_eq!(
            InboundEnvelope::parse(
                r#"{"type":"reaction","payload":{"message_id":"m1","emoji":" "}}"#
            )
                .unwrap_err()
                .reason(),
            "invalid_payload"
        );
        assert_eq!(
            InboundEnvelope::parse(
                r#"{"type":"delete","payload":{"message_id":"m1","scope":"everyone"}}"#
            )
                .unwrap_err()
                .reason(),
            "invalid_payload"
        );
    }
}
