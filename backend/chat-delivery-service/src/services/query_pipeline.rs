//! Read side: history pages, last message and point lookups, all decrypted.

use super::encryption::EncryptionService;
use super::recent_cache::RecentMessageCache;
use crate::error::{AppError, AppResult};
use crate::models::{Message, MessageView};
use crate::store::{MessageStore, RangeQuery};
use chrono::{DateTime, Utc};
use resilience::{with_timeout_result, TimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 100;

pub struct QueryPipeline {
    messages: Arc<dyn MessageStore>,
    cache: Arc<dyn RecentMessageCache>,
    encryption: EncryptionService,
    store_timeout: Duration,
}

impl QueryPipeline {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        cache: Arc<dyn RecentMessageCache>,
        encryption: EncryptionService,
        store_timeout: Duration,
    ) -> Self {
        Self {
            messages,
            cache,
            encryption,
            store_timeout,
        }
    }

    /// Up to `limit` messages older than `before` (or the newest ones when
    /// unset), returned oldest first. Messages hidden from `viewer` are left out.
    pub async fn get_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
        viewer: Option<&str>,
    ) -> AppResult<Vec<MessageView>> {
        let limit = match limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let newest_first = match self.from_cache(conversation_id, limit, before, viewer).await {
            Some(cached) => cached,
            None => {
                let query = RangeQuery {
                    limit,
                    before,
                    viewer: viewer.map(str::to_string),
                };
                self.bounded(self.messages.find_range(conversation_id, &query))
                    .await?
            }
        };

        Ok(newest_first
            .iter()
            .rev()
            .map(|message| self.encryption.view(message))
            .collect())
    }

    pub async fn get_last_message(
        &self,
        conversation_id: &str,
        viewer: Option<&str>,
    ) -> AppResult<Option<MessageView>> {
        Ok(self
            .get_messages(conversation_id, 1, None, viewer)
            .await?
            .pop())
    }

    pub async fn get_message_by_id(
        &self,
        message_id: &str,
        viewer: Option<&str>,
    ) -> AppResult<MessageView> {
        let message = self
            .bounded(self.messages.find_by_id(message_id))
            .await?
            .filter(|m| m.is_visible_to(viewer))
            .ok_or(AppError::NotFound)?;
        Ok(self.encryption.view(&message))
    }

    /// Serve from the recency cache only when it can answer the whole page.
    async fn from_cache(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
        viewer: Option<&str>,
    ) -> Option<Vec<Message>> {
        if before.is_some() {
            return None;
        }
        match self.cache.recent(conversation_id, limit).await {
            Ok(cached)
                if cached.len() >= limit && cached.iter().all(|m| m.is_visible_to(viewer)) =>
            {
                Some(cached)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(conversation_id, error = %e, "Recent cache unavailable, reading store");
                None
            }
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> AppResult<T>
    where
        F: std::future::Future<Output = AppResult<T>>,
    {
        match with_timeout_result(self.store_timeout, fut).await {
            Ok(value) => Ok(value),
            Err(TimeoutError::Elapsed(_)) => {
                Err(AppError::ServiceUnavailable("message store timed out".into()))
            }
            Err(TimeoutError::Failed(e)) => Err(e),
        }
    }
}
