//! Short list of the newest messages per conversation, used to serve the
//! first history page without touching the store.

use crate::error::{AppError, AppResult};
use crate::models::Message;
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use resilience::{with_timeout_result, TimeoutError};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

#[async_trait]
pub trait RecentMessageCache: Send + Sync {
    async fn push(&self, message: &Message) -> AppResult<()>;

    /// Newest first, at most `limit` entries.
    async fn recent(&self, conversation_id: &str, limit: usize) -> AppResult<Vec<Message>>;

    async fn invalidate(&self, conversation_id: &str) -> AppResult<()>;
}

pub struct RedisRecentCache {
    redis: RedisClient,
    size: usize,
    ttl: Duration,
    call_timeout: Duration,
}

impl RedisRecentCache {
    pub fn new(redis: RedisClient, size: usize, ttl: Duration, call_timeout: Duration) -> Self {
        Self {
            redis,
            size: size.max(1),
            ttl,
            call_timeout,
        }
    }

    fn key(conversation_id: &str) -> String {
        format!("chat:recent:{conversation_id}")
    }

    /// Bound a whole Redis round trip, connection setup included.
    async fn bounded<T, F>(&self, fut: F) -> AppResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match with_timeout_result(self.call_timeout, fut).await {
            Ok(value) => Ok(value),
            Err(TimeoutError::Elapsed(d)) => Err(AppError::ServiceUnavailable(format!(
                "recent cache timed out after {d:?}"
            ))),
            Err(TimeoutError::Failed(e)) => Err(AppError::ServiceUnavailable(e.to_string())),
        }
    }
}

#[async_trait]
impl RecentMessageCache for RedisRecentCache {
    async fn push(&self, message: &Message) -> AppResult<()> {
        let payload = serde_json::to_string(message).map_err(|e| {
            warn!(message_id = %message.id, error = %e, "Failed to encode message for cache");
            AppError::Internal
        })?;
        let key = Self::key(&message.conversation_id);
        let keep = self.size as isize - 1;
        let ttl_secs = self.ttl.as_secs() as i64;
        self.bounded(async {
            let mut conn = self.redis.connection().await?;
            redis::pipe()
                .atomic()
                .lpush(&key, payload)
                .ignore()
                .ltrim(&key, 0, keep)
                .ignore()
                .expire(&key, ttl_secs)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> AppResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = Self::key(conversation_id);
        let raw: Vec<String> = self
            .bounded(async {
                let mut conn = self.redis.connection().await?;
                redis::cmd("LRANGE")
                    .arg(&key)
                    .arg(0)
                    .arg(limit as isize - 1)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let mut messages = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<Message>(&entry) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(conversation_id, error = %e, "Dropping corrupt recent-cache entry");
                }
            }
        }
        Ok(messages)
    }

    async fn invalidate(&self, conversation_id: &str) -> AppResult<()> {
        let key = Self::key(conversation_id);
        self.bounded(async {
            let mut conn = self.redis.connection().await?;
            redis::cmd("DEL").arg(&key).query_async::<_, ()>(&mut conn).await
        })
        .await
    }
}

/// Process-local cache for tests and single-node runs.
pub struct InMemoryRecentCache {
    size: usize,
    entries: RwLock<HashMap<String, VecDeque<Message>>>,
}

impl InMemoryRecentCache {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RecentMessageCache for InMemoryRecentCache {
    async fn push(&self, message: &Message) -> AppResult<()> {
        let mut entries = self.entries.write().await;
        let list = entries.entry(message.conversation_id.clone()).or_default();
        list.push_front(message.clone());
        list.truncate(self.size);
        Ok(())
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> AppResult<Vec<Message>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(conversation_id)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn invalidate(&self, conversation_id: &str) -> AppResult<()> {
        self.entries.write().await.remove(conversation_id);
        Ok(())
    }
}
