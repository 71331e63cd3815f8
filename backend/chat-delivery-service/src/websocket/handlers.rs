//! Routes decoded inbound envelopes to the pipelines.

use super::connection::ConnectionHandle;
use super::events::{OutboundEvent, PresenceData, TypingData};
use super::message_types::{InboundEnvelope, SendMessagePayload};
use super::ConnectionHub;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Membership, NewMessage, PresenceStatus};
use crate::presence::PresenceStore;
use crate::services::{CommandPipeline, ConversationService};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct Dispatcher {
    commands: Arc<CommandPipeline>,
    conversations: ConversationService,
    hub: ConnectionHub,
    presence: Arc<dyn PresenceStore>,
    presence_ttl: Duration,
}

impl Dispatcher {
    pub fn new(
        commands: Arc<CommandPipeline>,
        conversations: ConversationService,
        hub: ConnectionHub,
        presence: Arc<dyn PresenceStore>,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            commands,
            conversations,
            hub,
            presence,
            presence_ttl,
        }
    }

    /// Decode and dispatch one text frame. Bad input never closes the connection.
    pub async fn handle_text(&self, conn: &ConnectionHandle, text: &str) {
        let envelope = match InboundEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::record_inbound_rejected(e.reason());
                warn!(
                    connection_id = %conn.id(),
                    user_id = %conn.user_id(),
                    error = %e,
                    "Dropping inbound envelope"
                );
                conn.push_event(&OutboundEvent::error("invalid_envelope", e.to_string()));
                return;
            }
        };

        let kind = envelope.kind();
        if let Err(e) = self.dispatch(conn, envelope).await {
            warn!(
                connection_id = %conn.id(),
                user_id = %conn.user_id(),
                envelope = kind,
                error = %e,
                retryable = e.is_retryable(),
                "Inbound command failed"
            );
            conn.push_event(&OutboundEvent::error(e.code(), e.to_string()));
        }
    }

    pub async fn dispatch(
        &self,
        conn: &ConnectionHandle,
        envelope: InboundEnvelope,
    ) -> AppResult<()> {
        match envelope {
            InboundEnvelope::Message(payload) => self.send_message(conn, payload).await,
            InboundEnvelope::Typing(payload) => {
                let frame = OutboundEvent::Typing(TypingData {
                    conversation_id: conn.conversation_id().to_string(),
                    user_id: conn.user_id().to_string(),
                    is_typing: payload.is_typing,
                })
                .to_frame()?;
                self.hub
                    .broadcast_to_conversation(conn.conversation_id(), frame)
                    .await;
                Ok(())
            }
            InboundEnvelope::Read(payload) => {
                self.commands
                    .mark_read(&payload.message_id, conn.user_id())
                    .await?;
                Ok(())
            }
            InboundEnvelope::Reaction(payload) => {
                self.commands
                    .add_reaction(&payload.message_id, &payload.emoji, conn.user_id())
                    .await?;
                Ok(())
            }
            InboundEnvelope::Presence => {
                if let Err(e) = self.presence.refresh(conn.user_id(), self.presence_ttl).await {
                    debug!(user_id = %conn.user_id(), error = %e, "Presence refresh failed");
                }
                let frame = OutboundEvent::Presence(PresenceData {
                    user_id: conn.user_id().to_string(),
                    conversation_id: conn.conversation_id().to_string(),
                    status: PresenceStatus::Online,
                    last_seen: Utc::now(),
                })
                .to_frame()?;
                self.hub
                    .broadcast_to_conversation(conn.conversation_id(), frame)
                    .await;
                Ok(())
            }
            InboundEnvelope::Edit(payload) => {
                self.commands
                    .edit_message(&payload.message_id, &payload.content)
                    .await?;
                Ok(())
            }
            InboundEnvelope::Delete(payload) => {
                self.commands
                    .delete_message(&payload.message_id, conn.user_id(), payload.scope)
                    .await?;
                Ok(())
            }
        }
    }

    async fn send_message(
        &self,
        conn: &ConnectionHandle,
        payload: SendMessagePayload,
    ) -> AppResult<()> {
        let conversation_id = payload
            .conversation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| conn.conversation_id().to_string());

        if conversation_id != conn.conversation_id()
            && self
                .conversations
                .membership(&conversation_id, conn.user_id())
                .await?
                == Membership::NotMember
        {
            return Err(AppError::Forbidden);
        }

        self.commands
            .create_message(NewMessage {
                id: payload.id,
                conversation_id,
                sender_id: conn.user_id().to_string(),
                content: payload.content,
                kind: payload.kind.unwrap_or_default(),
                reply_to: payload.reply_to,
                metadata: payload.metadata,
            })
            .await?;
        Ok(())
    }
}
