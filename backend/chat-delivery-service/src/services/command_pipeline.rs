//! Message mutations: persist, refresh the recency cache, deliver locally,
//! then publish to the durable log.
//!
//! Local delivery never waits on the log. A publish that exhausts its retries
//! leaves the message persisted and is reported as [`RelayStatus::Degraded`].

use super::conversation_service::ConversationService;
use super::encryption::EncryptionService;
use super::recent_cache::RecentMessageCache;
use crate::error::{AppError, AppResult};
use crate::event_log::EventPublisher;
use crate::metrics;
use crate::models::{DeleteScope, Message, NewMessage};
use crate::store::{MessageStore, SetMutation};
use crate::websocket::events::audience_for;
use crate::websocket::{BroadcastReport, ConnectionHub, OutboundEvent};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use event_schema::{
    MessageCreatedEvent, MessageDeletedEvent, MessageEditedEvent, MessageEvent,
    MessageReactionEvent,
    MessageReadEvent,
};
use resilience::{with_timeout_result, TimeoutError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    /// Accepted by the durable log.
    Published,
    /// Nothing changed, so nothing was published.
    Skipped,
    /// Persisted and delivered locally, but the log publish gave up.
    Degraded(String),
}

#[derive(Debug, Clone)]
pub struct CommandOutcome<T> {
    pub value: T,
    pub relay: RelayStatus,
}

impl<T> CommandOutcome<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self.relay, RelayStatus::Degraded(_))
    }
}

pub struct CommandPipeline {
    messages: Arc<dyn MessageStore>,
    conversations: ConversationService,
    cache: Arc<dyn RecentMessageCache>,
    encryption: EncryptionService,
    publisher: EventPublisher,
    hub: ConnectionHub,
    store_timeout: Duration,
}

impl CommandPipeline {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        conversations: ConversationService,
        cache: Arc<dyn RecentMessageCache>,
        encryption: EncryptionService,
        publisher: EventPublisher,
        hub: ConnectionHub,
        store_timeout: Duration,
    ) -> Self {
        Self {
            messages,
            conversations,
            cache,
            encryption,
            publisher,
            hub,
            store_timeout,
        }
    }

    /// Create a message. Idempotent on `id`: a resend returns the stored
    /// document and re-publishes the same `message.new` event.
    pub async fn create_message(&self, new: NewMessage) -> AppResult<CommandOutcome<Message>> {
        if new.conversation_id.trim().is_empty() {
            return Err(AppError::BadRequest("conversation_id is required".into()));
        }
        if new.sender_id.trim().is_empty() {
            return Err(AppError::BadRequest("sender_id is required".into()));
        }

        let id = new
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.bounded(
            "ensure_conversation",
            self.conversations
                .ensure_exists(&new.conversation_id, &new.sender_id),
        )
        .await?;

        let sealed = self
            .encryption
            .encrypt(&new.conversation_id, new.content.as_bytes())?;
        let message = Message {
            id,
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: sealed,
            kind: new.kind,
            reply_to: new.reply_to,
            metadata: new.metadata,
            created_at: Utc::now(),
            edited_at: None,
            delivered: false,
            read_by: Default::default(),
            deleted_for: Default::default(),
            reactions: Default::default(),
        };
        let requested_conversation = message.conversation_id.clone();

        let (mut stored, inserted) = self
            .bounded("insert_message", self.messages.insert_if_absent(message))
            .await?;

        if stored.conversation_id != requested_conversation {
            warn!(
                message_id = %stored.id,
                stored_conversation = %stored.conversation_id,
                requested_conversation = %requested_conversation,
                "Message id reused across conversations"
            );
            return Err(AppError::Conflict(format!(
                "message {} belongs to another conversation",
                stored.id
            )));
        }

        if inserted {
            info!(
                message_id = %stored.id,
                conversation_id = %stored.conversation_id,
                sender_id = %stored.sender_id,
                "Message created"
            );
        } else {
            debug!(message_id = %stored.id, "Duplicate create, re-publishing stored message");
        }

        let event = MessageEvent::Created(MessageCreatedEvent {
            message_id: stored.id.clone(),
            conversation_id: stored.conversation_id.clone(),
            sender_id: stored.sender_id.clone(),
            kind: stored.kind.as_str().to_string(),
            content: STANDARD.encode(&stored.content),
            reply_to: stored.reply_to.clone(),
            metadata: stored.metadata.clone(),
            created_at: stored.created_at,
        });
        self.fan_out(&event).await;
        if inserted {
            if let Err(e) = self.cache.push(&stored).await {
                warn!(
                    conversation_id = %stored.conversation_id,
                    error = %e,
                    "Recent cache update failed"
                );
            }
        }

        let event_id = MessageEvent::created_event_id(&stored.id);
        let relay = self.publish(event, Some(event_id), &stored.sender_id).await;

        if relay == RelayStatus::Published && !stored.delivered {
            match self
                .bounded("mark_delivered", self.messages.mark_delivered(&stored.id))
                .await
            {
                Ok(()) => stored.delivered = true,
                Err(e) => {
                    debug!(message_id = %stored.id, error = %e, "Failed to set delivered flag")
                }
            }
        }

        Ok(CommandOutcome {
            value: stored,
            relay,
        })
    }

    /// Add `user_id` to the reader set. Returns the owning conversation id.
    pub async fn mark_read(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> AppResult<CommandOutcome<String>> {
        let mutation = self
            .bounded("add_reader", self.messages.add_reader(message_id, user_id))
            .await?;
        let Some(conversation_id) = Self::applied(mutation)? else {
            return Ok(CommandOutcome {
                value: self.owning_conversation(message_id).await?,
                relay: RelayStatus::Skipped,
            });
        };

        let event = MessageEvent::Read(MessageReadEvent {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.clone(),
            user_id: user_id.to_string(),
            read_at: Utc::now(),
        });
        self.fan_out(&event).await;
        self.invalidate_cache(&conversation_id).await;
        let relay = self.publish(event, None, user_id).await;
        Ok(CommandOutcome {
            value: conversation_id,
            relay,
        })
    }

    /// Re-encrypt and replace content, stamping the edit time.
    pub async fn edit_message(
        &self,
        message_id: &str,
        content: &str,
    ) -> AppResult<CommandOutcome<String>> {
        let existing = self
            .bounded("find_message", self.messages.find_by_id(message_id))
            .await?
            .ok_or(AppError::NotFound)?;

        let sealed = self
            .encryption
            .encrypt(&existing.conversation_id, content.as_bytes())?;
        let edited_at = Utc::now();
        let conversation_id = self
            .bounded(
                "replace_content",
                self.messages
                    .replace_content(message_id, sealed.clone(), edited_at),
            )
            .await?
            .ok_or(AppError::NotFound)?;

        let event = MessageEvent::Edited(MessageEditedEvent {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.clone(),
            content: STANDARD.encode(&sealed),
            edited_at,
        });
        self.fan_out(&event).await;
        self.invalidate_cache(&conversation_id).await;
        let relay = self.publish(event, None, &existing.sender_id).await;
        Ok(CommandOutcome {
            value: conversation_id,
            relay,
        })
    }

    /// `Me` hides the message for `user_id`; `All` removes it for everybody.
    pub async fn delete_message(
        &self,
        message_id: &str,
        user_id: &str,
        scope: DeleteScope,
    ) -> AppResult<CommandOutcome<String>> {
        let conversation_id = match scope {
            DeleteScope::Me => {
                let mutation = self
                    .bounded(
                        "add_deleted_for",
                        self.messages.add_deleted_for(message_id, user_id),
                    )
                    .await?;
                match Self::applied(mutation)? {
                    Some(conversation_id) => conversation_id,
                    None => {
                        return Ok(CommandOutcome {
                            value: self.owning_conversation(message_id).await?,
                            relay: RelayStatus::Skipped,
                        })
                    }
                }
            }
            DeleteScope::All => {
                let conversation_id = self
                    .bounded("delete_message", self.messages.delete(message_id))
                    .await?
                    .ok_or(AppError::NotFound)?;
                conversation_id
            }
        };

        info!(message_id, user_id, scope = scope.as_str(), "Message deleted");
        let event = MessageEvent::Deleted(MessageDeletedEvent {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.clone(),
            user_id: user_id.to_string(),
            scope,
            deleted_at: Utc::now(),
        });
        self.fan_out(&event).await;
        self.invalidate_cache(&conversation_id).await;
        let relay = self.publish(event, None, user_id).await;
        Ok(CommandOutcome {
            value: conversation_id,
            relay,
        })
    }

    pub async fn add_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> AppResult<CommandOutcome<String>> {
        if emoji.trim().is_empty() {
            return Err(AppError::BadRequest("emoji is required".into()));
        }
        let mutation = self
            .bounded(
                "add_reaction",
                self.messages.add_reaction(message_id, emoji, user_id),
            )
            .await?;
        let Some(conversation_id) = Self::applied(mutation)? else {
            return Ok(CommandOutcome {
                value: self.owning_conversation(message_id).await?,
                relay: RelayStatus::Skipped,
            });
        };

        let event = MessageEvent::Reaction(MessageReactionEvent {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.clone(),
            user_id: user_id.to_string(),
            emoji: emoji.to_string(),
            reacted_at: Utc::now(),
        });
        self.fan_out(&event).await;
        self.invalidate_cache(&conversation_id).await;
        let relay = self.publish(event, None, user_id).await;
        Ok(CommandOutcome {
            value: conversation_id,
            relay,
        })
    }

    /// `Some(conversation)` when the set actually changed, `None` for a no-op,
    /// `NotFound` when the message is missing.
    fn applied(mutation: Option<SetMutation>) -> AppResult<Option<String>> {
        match mutation {
            None => Err(AppError::NotFound),
            Some(m) if m.changed => Ok(Some(m.conversation_id)),
            Some(_) => Ok(None),
        }
    }

    async fn owning_conversation(&self, message_id: &str) -> AppResult<String> {
        self.bounded("find_message", self.messages.find_by_id(message_id))
            .await?
            .map(|m| m.conversation_id)
            .ok_or(AppError::NotFound)
    }

    async fn invalidate_cache(&self, conversation_id: &str) {
        if let Err(e) = self.cache.invalidate(conversation_id).await {
            warn!(conversation_id, error = %e, "Recent cache invalidation failed");
        }
    }

    async fn fan_out(&self, event: &MessageEvent) -> BroadcastReport {
        let frame = match OutboundEvent::from_message_event(event, &self.encryption).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    event_type = event.event_type(),
                    message_id = event.message_id(),
                    error = %e,
                    "Failed to encode outbound event, local fan-out skipped"
                );
                return BroadcastReport::default();
            }
        };
        let report = self.hub.deliver(&audience_for(event), frame).await;
        debug!(
            event_type = event.event_type(),
            message_id = event.message_id(),
            delivered = report.delivered,
            dropped = report.dropped,
            "Local fan-out complete"
        );
        report
    }

    async fn publish(
        &self,
        event: MessageEvent,
        event_id: Option<Uuid>,
        notify_user: &str,
    ) -> RelayStatus {
        let event_type = event.event_type();
        let message_id = event.message_id().to_string();
        match self.publisher.publish(event, event_id).await {
            Ok(event_id) => {
                debug!(%event_id, event_type, %message_id, "Event published");
                RelayStatus::Published
            }
            Err(e) => {
                metrics::record_publish_failure(event_type);
                warn!(
                    event_type,
                    %message_id,
                    error = %e,
                    "Durable log publish failed; cross-instance fan-out degraded"
                );
                let warning = OutboundEvent::warning(
                    "relay_degraded",
                    "message saved but delivery to other devices may be delayed",
                    Some(message_id),
                );
                if let Ok(frame) = warning.to_frame() {
                    self.hub.send_to_user(notify_user, frame).await;
                }
                RelayStatus::Degraded(e.to_string())
            }
        }
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        match with_timeout_result(self.store_timeout, fut).await {
            Ok(value) => Ok(value),
            Err(TimeoutError::Elapsed(d)) => {
                warn!(op, timeout_ms = d.as_millis() as u64, "Store call timed out");
                Err(AppError::ServiceUnavailable(format!("{op} timed out")))
            }
            Err(TimeoutError::Failed(e)) => Err(e),
        }
    }
}
