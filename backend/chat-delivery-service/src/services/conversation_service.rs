use crate::error::{AppError, AppResult};
use crate::models::{Conversation, Membership};
use crate::store::ConversationStore;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const DIRECT_CONVERSATION_NAMESPACE: Uuid =
    Uuid::from_u128(0x2b8e_41d7_9a35_4c06_8f12_c3a9_7e5d_0b44);

/// Conversation membership and lifecycle.
#[derive(Clone)]
pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
}

impl ConversationService {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Direct conversation between two distinct users. The id is derived from
    /// the sorted pair, so asking twice returns the same conversation.
    pub async fn create_direct(&self, user_a: &str, user_b: &str) -> AppResult<Conversation> {
        if user_a == user_b {
            return Err(AppError::BadRequest(
                "direct conversation needs two distinct users".into(),
            ));
        }
        let (low, high) = if user_a < user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };
        let id = Uuid::new_v5(
            &DIRECT_CONVERSATION_NAMESPACE,
            format!("{low}\u{0}{high}").as_bytes(),
        )
        .to_string();

        let now = Utc::now();
        let conversation = Conversation {
            id,
            members: [low.to_string(), high.to_string()].into_iter().collect(),
            is_group: false,
            name: None,
            created_at: now,
            updated_at: now,
        };
        conversation.validate()?;
        self.store.insert_if_absent(conversation).await
    }

    pub async fn create_group(
        &self,
        creator: &str,
        members: impl IntoIterator<Item = String>,
        name: Option<String>,
    ) -> AppResult<Conversation> {
        let mut members: BTreeSet<String> = members.into_iter().collect();
        members.insert(creator.to_string());
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            members,
            is_group: true,
            name,
            created_at: now,
            updated_at: now,
        };
        conversation.validate()?;
        let stored = self.store.insert_if_absent(conversation).await?;
        info!(
            conversation_id = %stored.id,
            members = stored.members.len(),
            "Created group conversation"
        );
        Ok(stored)
    }

    /// Look up a conversation, creating it as a group containing `creator` if unknown.
    pub async fn ensure_exists(
        &self,
        conversation_id: &str,
        creator: &str,
    ) -> AppResult<Conversation> {
        if let Some(existing) = self.store.find_by_id(conversation_id).await? {
            return Ok(existing);
        }
        let now = Utc::now();
        let conversation = Conversation {
            id: conversation_id.to_string(),
            members: BTreeSet::from([creator.to_string()]),
            is_group: true,
            name: None,
            created_at: now,
            updated_at: now,
        };
        let stored = self.store.insert_if_absent(conversation).await?;
        info!(conversation_id, creator, "Created conversation on first message");
        Ok(stored)
    }

    pub async fn get(&self, conversation_id: &str) -> AppResult<Conversation> {
        self.store
            .find_by_id(conversation_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn membership(&self, conversation_id: &str, user_id: &str) -> AppResult<Membership> {
        Ok(match self.store.find_by_id(conversation_id).await? {
            Some(c) if c.is_member(user_id) => Membership::Member,
            Some(_) => Membership::NotMember,
            None => Membership::Unknown,
        })
    }

    pub async fn is_member(&self, conversation_id: &str, user_id: &str) -> AppResult<bool> {
        Ok(self.membership(conversation_id, user_id).await? == Membership::Member)
    }

    pub async fn add_member(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> AppResult<Conversation> {
        let mut conversation = self.get(conversation_id).await?;
        if !conversation.is_group {
            return Err(AppError::BadRequest(
                "cannot add members to a direct conversation".into(),
            ));
        }
        if conversation.members.insert(user_id.to_string()) {
            conversation.updated_at = Utc::now();
            self.save(&conversation).await?;
        }
        Ok(conversation)
    }

    pub async fn remove_member(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> AppResult<Conversation> {
        let mut conversation = self.get(conversation_id).await?;
        if !conversation.is_group {
            return Err(AppError::BadRequest(
                "cannot remove members from a direct conversation".into(),
            ));
        }
        if !conversation.is_member(user_id) {
            return Ok(conversation);
        }
        if conversation.members.len() == 1 {
            return Err(AppError::BadRequest(
                "cannot remove the last member of a conversation".into(),
            ));
        }
        conversation.members.remove(user_id);
        conversation.updated_at = Utc::now();
        self.save(&conversation).await?;
        Ok(conversation)
    }

    pub async fn rename(
        &self,
        conversation_id: &str,
        name: Option<String>,
    ) -> AppResult<Conversation> {
        let mut conversation = self.get(conversation_id).await?;
        conversation.name = name;
        conversation.updated_at = Utc::now();
        self.save(&conversation).await?;
        Ok(conversation)
    }

    async fn save(&self, conversation: &Conversation) -> AppResult<()> {
        conversation.validate()?;
        if self.store.update(conversation).await? {
            Ok(())
        } else {
            Err(AppError::NotFound)
        }
    }
}
