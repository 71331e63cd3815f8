use super::{ConversationStore, MessageStore, RangeQuery, SetMutation};
use crate::error::AppResult;
use crate::models::{Conversation, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

/// Process-local message store for tests and single-node development.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<String, Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    async fn mutate_set<F>(&self, message_id: &str, apply: F) -> AppResult<Option<SetMutation>>
    where
        F: FnOnce(&mut Message) -> bool + Send,
    {
        let mut guard = self.messages.write().await;
        Ok(guard.get_mut(message_id).map(|message| SetMutation {
            changed: apply(message),
            conversation_id: message.conversation_id.clone(),
        }))
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert_if_absent(&self, message: Message) -> AppResult<(Message, bool)> {
        let mut guard = self.messages.write().await;
        if let Some(existing) = guard.get(&message.id) {
            return Ok((existing.clone(), false));
        }
        guard.insert(message.id.clone(), message.clone());
        Ok((message, true))
    }

    async fn find_by_id(&self, message_id: &str) -> AppResult<Option<Message>> {
        Ok(self.messages.read().await.get(message_id).cloned())
    }

    async fn find_range(
        &self,
        conversation_id: &str,
        query: &RangeQuery,
    ) -> AppResult<Vec<Message>> {
        let guard = self.messages.read().await;
        let mut found: Vec<Message> = guard
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| query.before.map_or(true, |before| m.created_at < before))
            .filter(|m| m.is_visible_to(query.viewer.as_deref()))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        found.truncate(query.limit);
        Ok(found)
    }

    async fn add_reader(&self, message_id: &str, user_id: &str) -> AppResult<Option<SetMutation>> {
        let user = user_id.to_string();
        self.mutate_set(message_id, move |m| m.read_by.insert(user))
            .await
    }

    async fn add_deleted_for(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> AppResult<Option<SetMutation>> {
        let user = user_id.to_string();
        self.mutate_set(message_id, move |m| m.deleted_for.insert(user))
            .await
    }

    async fn add_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> AppResult<Option<SetMutation>> {
        let emoji = emoji.to_string();
        let user = user_id.to_string();
        self.mutate_set(message_id, move |m| {
            m.reactions
                .entry(emoji)
                .or_insert_with(BTreeSet::new)
                .insert(user)
        })
        .await
    }

    async fn replace_content(
        &self,
        message_id: &str,
        content: Vec<u8>,
        edited_at: DateTime<Utc>,
    ) -> AppResult<Option<String>> {
        let mut guard = self.messages.write().await;
        Ok(guard.get_mut(message_id).map(|m| {
            m.content = content;
            m.edited_at = Some(edited_at);
            m.conversation_id.clone()
        }))
    }

    async fn mark_delivered(&self, message_id: &str) -> AppResult<()> {
        if let Some(m) = self.messages.write().await.get_mut(message_id) {
            m.delivered = true;
        }
        Ok(())
    }

    async fn delete(&self, message_id: &str) -> AppResult<Option<String>> {
        Ok(self
            .messages
            .write()
            .await
            .remove(message_id)
            .map(|m| m.conversation_id))
    }
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn insert_if_absent(&self, conversation: Conversation) -> AppResult<Conversation> {
        let mut guard = self.conversations.write().await;
        Ok(guard
            .entry(conversation.id.clone())
            .or_insert(conversation)
            .clone())
    }

    async fn find_by_id(&self, conversation_id: &str) -> AppResult<Option<Conversation>> {
        Ok(self.conversations.read().await.get(conversation_id).cloned())
    }

    async fn update(&self, conversation: &Conversation) -> AppResult<bool> {
        let mut guard = self.conversations.write().await;
        match guard.get_mut(&conversation.id) {
            Some(stored) => {
                stored.members = conversation.members.clone();
                stored.name = conversation.name.clone();
                stored.updated_at = conversation.updated_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
