//! Outbound frames: `{"event": "<name>", "data": {...}}`.

use super::Audience;
use crate::error::{AppError, AppResult};
use crate::models::{DeleteScope, MessageKind, MessageView, PresenceStatus};
use crate::services::encryption::EncryptionService;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use event_schema::MessageEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    MessageCreated(MessageView),
    MessageUpdated(MessageUpdatedData),
    MessageDeleted(MessageDeletedData),
    MessageRead(MessageReadData),
    MessageReaction(MessageReactionData),
    Typing(TypingData),
    Presence(PresenceData),
    Warning(NoticeData),
    Error(NoticeData),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageUpdatedData {
    pub message_id: String,
    pub conversation_id: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub content_unavailable: bool,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDeletedData {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub scope: DeleteScope,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageReadData {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageReactionData {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypingData {
    pub conversation_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceData {
    pub user_id: String,
    pub conversation_id: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoticeData {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl OutboundEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundEvent::MessageCreated(_) => "message_created",
            OutboundEvent::MessageUpdated(_) => "message_updated",
            OutboundEvent::MessageDeleted(_) => "message_deleted",
            OutboundEvent::MessageRead(_) => "message_read",
            OutboundEvent::MessageReaction(_) => "message_reaction",
            OutboundEvent::Typing(_) => "typing",
            OutboundEvent::Presence(_) => "presence",
            OutboundEvent::Warning(_) => "warning",
            OutboundEvent::Error(_) => "error",
        }
    }

    pub fn warning(code: &str, message: impl Into<String>, message_id: Option<String>) -> Self {
        OutboundEvent::Warning(NoticeData {
            code: code.to_string(),
            message: message.into(),
            message_id,
        })
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        OutboundEvent::Error(NoticeData {
            code: code.to_string(),
            message: message.into(),
            message_id: None,
        })
    }

    /// Serialize once; the resulting frame is shared by every recipient.
    pub fn to_frame(&self) -> AppResult<Arc<str>> {
        serde_json::to_string(self)
            .map(Arc::from)
            .map_err(|e| {
                warn!(event = self.event_name(), error = %e, "Outbound event serialization failed");
                AppError::Internal
            })
    }

    /// Build the client-facing frame for a lifecycle event, decrypting any content.
    pub fn from_message_event(event: &MessageEvent, encryption: &EncryptionService) -> Self {
        match event {
            MessageEvent::Created(e) => {
                let content = decode_content(&e.conversation_id, &e.content, encryption);
                OutboundEvent::MessageCreated(MessageView {
                    id: e.message_id.clone(),
                    conversation_id: e.conversation_id.clone(),
                    sender_id: e.sender_id.clone(),
                    content_unavailable: content.is_none(),
                    content,
                    kind: e.kind.parse::<MessageKind>().unwrap_or_default(),
                    reply_to: e.reply_to.clone(),
                    metadata: e.metadata.clone(),
                    created_at: e.created_at,
                    edited_at: None,
                    delivered: false,
                    read_by: Vec::new(),
                    reactions: Default::default(),
                })
            }
            MessageEvent::Edited(e) => {
                let content = decode_content(&e.conversation_id, &e.content, encryption);
                OutboundEvent::MessageUpdated(MessageUpdatedData {
                    message_id: e.message_id.clone(),
                    conversation_id: e.conversation_id.clone(),
                    content_unavailable: content.is_none(),
                    content,
                    edited_at: e.edited_at,
                })
            }
            MessageEvent::Deleted(e) => OutboundEvent::MessageDeleted(MessageDeletedData {
                message_id: e.message_id.clone(),
                conversation_id: e.conversation_id.clone(),
                user_id: e.user_id.clone(),
                scope: e.scope,
            }),
            MessageEvent::Read(e) => OutboundEvent::MessageRead(MessageReadData {
                message_id: e.message_id.clone(),
                conversation_id: e.conversation_id.clone(),
                user_id: e.user_id.clone(),
                read_at: e.read_at,
            }),
            MessageEvent::Reaction(e) => OutboundEvent::MessageReaction(MessageReactionData {
                message_id: e.message_id.clone(),
                conversation_id: e.conversation_id.clone(),
                user_id: e.user_id.clone(),
                emoji: e.emoji.clone(),
            }),
        }
    }
}

/// Who should see a lifecycle event. A delete for one user goes only to that user.
pub fn audience_for(event: &MessageEvent) -> Audience {
    match event {
        MessageEvent::Deleted(e) if e.scope == DeleteScope::Me => Audience::User(e.user_id.clone()),
        other => Audience::Conversation(other.conversation_id().to_string()),
    }
}

fn decode_content(
    conversation_id: &str,
    encoded: &str,
    encryption: &EncryptionService,
) -> Option<String> {
    match STANDARD.decode(encoded) {
        Ok(sealed) => encryption.decrypt_text(conversation_id, &sealed),
        Err(e) => {
            warn!(conversation_id, error = %e, "Event content is not valid base64");
            crate::metrics::record_decrypt_failure();
            None
        }
    }
}
