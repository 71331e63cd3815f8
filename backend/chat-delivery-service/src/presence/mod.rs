//! Shared presence state and the pub/sub primitive used for cross-instance signals.
//!
//! Callers must treat every error here as "unknown": presence is best effort and
//! never blocks local delivery.

use crate::models::{ConnectionMeta, PresenceRecord};
use async_trait::async_trait;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryPresenceStore;
pub use self::redis::RedisPresenceStore;

pub const CONVERSATION_CHANNEL_PREFIX: &str = "conversation:";
pub const USER_CHANNEL_PREFIX: &str = "user:";
pub const RELAY_PATTERNS: [&str; 2] = ["conversation:*", "user:*"];

pub fn conversation_channel(conversation_id: &str) -> String {
    format!("{CONVERSATION_CHANNEL_PREFIX}{conversation_id}")
}

pub fn user_channel(user_id: &str) -> String {
    format!("{USER_CHANNEL_PREFIX}{user_id}")
}

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence backend error: {0}")]
    Backend(String),
    #[error("presence call timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt presence record: {0}")]
    Corrupt(String),
}

impl From<::redis::RedisError> for PresenceError {
    fn from(e: ::redis::RedisError) -> Self {
        PresenceError::Backend(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

pub type PubSubStream = Pin<Box<dyn Stream<Item = PubSubMessage> + Send>>;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Record a live connection and mark the user online.
    /// Returns true when the user had no other live connection.
    async fn add_connection(
        &self,
        user_id: &str,
        meta: ConnectionMeta,
        ttl: Duration,
    ) -> Result<bool, PresenceError>;

    /// Remove one connection entry. When none remain the user flips to offline,
    /// `last_seen` is stamped and true is returned.
    async fn remove_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<bool, PresenceError>;

    /// Extend the TTL of the user's connection set and presence record.
    async fn refresh(&self, user_id: &str, ttl: Duration) -> Result<(), PresenceError>;

    async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>, PresenceError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PresenceError>;

    /// Subscribe to glob patterns (`conversation:*`). The stream ends when the
    /// backend connection drops.
    async fn subscribe(&self, patterns: &[&str]) -> Result<PubSubStream, PresenceError>;
}

/// Bound a presence call so a partitioned backend cannot stall the caller.
pub(crate) async fn bounded<T, E, F>(limit: Duration, fut: F) -> Result<T, PresenceError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PresenceError>,
{
    match resilience::with_timeout_result(limit, fut).await {
        Ok(value) => Ok(value),
        Err(resilience::TimeoutError::Elapsed(d)) => Err(PresenceError::Timeout(d)),
        Err(resilience::TimeoutError::Failed(e)) => Err(e.into()),
    }
}

/// Glob match supporting only a trailing `*`, which is all the relay uses.
pub(crate) fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}
