//! System of record for message and conversation documents.

use crate::error::AppResult;
use crate::models::{Conversation, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryConversationStore, InMemoryMessageStore};
pub use postgres::{PostgresConversationStore, PostgresMessageStore};

#[derive(Debug, Clone, Default)]
pub struct RangeQuery {
    pub limit: usize,
    /// Only messages created strictly before this instant
    pub before: Option<DateTime<Utc>>,
    /// Hide messages this user deleted for themselves
    pub viewer: Option<String>,
}

/// Result of an add-only set mutation addressed by message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetMutation {
    pub conversation_id: String,
    /// False when the member was already present
    pub changed: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert keyed by id. Returns the stored document and whether this call created it.
    async fn insert_if_absent(&self, message: Message) -> AppResult<(Message, bool)>;

    async fn find_by_id(&self, message_id: &str) -> AppResult<Option<Message>>;

    /// Newest first.
    async fn find_range(&self, conversation_id: &str, query: &RangeQuery)
        -> AppResult<Vec<Message>>;

    async fn add_reader(&self, message_id: &str, user_id: &str) -> AppResult<Option<SetMutation>>;

    async fn add_deleted_for(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> AppResult<Option<SetMutation>>;

    async fn add_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> AppResult<Option<SetMutation>>;

    /// Returns the owning conversation id, or `None` if the message does not exist.
    async fn replace_content(
        &self,
        message_id: &str,
        content: Vec<u8>,
        edited_at: DateTime<Utc>,
    ) -> AppResult<Option<String>>;

    async fn mark_delivered(&self, message_id: &str) -> AppResult<()>;

    /// Hard delete. Returns the owning conversation id, or `None` if already gone.
    async fn delete(&self, message_id: &str) -> AppResult<Option<String>>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns the stored conversation, which is the existing one if the id was taken.
    async fn insert_if_absent(&self, conversation: Conversation) -> AppResult<Conversation>;

    async fn find_by_id(&self, conversation_id: &str) -> AppResult<Option<Conversation>>;

    /// Overwrite members, name and `updated_at`. Returns false if the conversation is missing.
    async fn update(&self, conversation: &Conversation) -> AppResult<bool>;
}
