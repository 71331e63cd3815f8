use super::{pattern_matches, PresenceError, PresenceStore, PubSubMessage, PubSubStream};
use crate::models::{ConnectionMeta, PresenceRecord, PresenceStatus};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

#[derive(Default)]
struct UserPresence {
    connections: HashMap<String, ConnectionMeta>,
    record: Option<PresenceRecord>,
}

/// In-process presence store. Several hubs sharing one instance behave like a
/// fleet sharing one Redis, which is how the relay tests run.
pub struct InMemoryPresenceStore {
    users: RwLock<HashMap<String, UserPresence>>,
    bus: broadcast::Sender<PubSubMessage>,
    unavailable: AtomicBool,
}

impl Default for InMemoryPresenceStore {
    fn default() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            users: RwLock::new(HashMap::new()),
            bus,
            unavailable: AtomicBool::new(false),
        }
    }
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), PresenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(PresenceError::Backend("presence backend unavailable".into()))
        } else {
            Ok(())
        }
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        self.users
            .read()
            .await
            .get(user_id)
            .map(|u| u.connections.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn add_connection(
        &self,
        user_id: &str,
        meta: ConnectionMeta,
        _ttl: Duration,
    ) -> Result<bool, PresenceError> {
        self.check_available()?;
        let mut users = self.users.write().await;
        let entry = users.entry(user_id.to_string()).or_default();
        let first = entry.connections.is_empty();
        entry.connections.insert(meta.connection_id.clone(), meta);
        entry.record = Some(PresenceRecord {
            user_id: user_id.to_string(),
            status: PresenceStatus::Online,
            last_seen: Utc::now(),
        });
        Ok(first)
    }

    async fn remove_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<bool, PresenceError> {
        self.check_available()?;
        let mut users = self.users.write().await;
        let Some(entry) = users.get_mut(user_id) else {
            return Ok(false);
        };
        entry.connections.remove(connection_id);
        if !entry.connections.is_empty() {
            return Ok(false);
        }
        entry.record = Some(PresenceRecord {
            user_id: user_id.to_string(),
            status: PresenceStatus::Offline,
            last_seen: Utc::now(),
        });
        Ok(true)
    }

    async fn refresh(&self, user_id: &str, _ttl: Duration) -> Result<(), PresenceError> {
        self.check_available()?;
        if let Some(entry) = self.users.write().await.get_mut(user_id) {
            if let Some(record) = entry.record.as_mut() {
                record.last_seen = Utc::now();
            }
        }
        Ok(())
    }

    async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>, PresenceError> {
        self.check_available()?;
        Ok(self
            .users
            .read()
            .await
            .get(user_id)
            .and_then(|u| u.record.clone()))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PresenceError> {
        self.check_available()?;
        // No subscribers is not an error, matching PUBLISH returning 0.
        let _ = self.bus.send(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, patterns: &[&str]) -> Result<PubSubStream, PresenceError> {
        self.check_available()?;
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        let stream = BroadcastStream::new(self.bus.subscribe()).filter_map(move |item| {
            let keep = match item {
                Ok(msg) if patterns.iter().any(|p| pattern_matches(p, &msg.channel)) => Some(msg),
                _ => None,
            };
            async move { keep }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(connection_id: &str) -> ConnectionMeta {
        ConnectionMeta {
            connection_id: connection_id.into(),
            conversation_id: "c1".into(),
            instance_id: "node-a".into(),
            connected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn last_connection_flips_offline() {
        let store = InMemoryPresenceStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.add_connection("u1", meta("a"), ttl).await.unwrap());
        assert!(!store.add_connection("u1", meta("b"), ttl).await.unwrap());

        assert!(!store.remove_connection("u1", "a").await.unwrap());
        let record = store.get_presence("u1").await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Online);

        assert!(store.remove_connection("u1", "b").await.unwrap());
        let record = store.get_presence("u1").await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn unknown_user_has_no_presence() {
        let store = InMemoryPresenceStore::new();
        assert!(store.get_presence("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn outage_surfaces_as_error() {
        let store = InMemoryPresenceStore::new();
        store.set_unavailable(true);
        assert!(store.get_presence("u1").await.is_err());
        assert!(store.publish("conversation:c1", "x").await.is_err());
    }

    #[tokio::test]
    async fn subscribe_filters_by_pattern() {
        let store = InMemoryPresenceStore::new();
        let mut stream = store.subscribe(&["user:*"]).await.unwrap();
        store.publish("conversation:c1", "ignored").await.unwrap();
        store.publish("user:u1", "hello").await.unwrap();

        let msg = stream.next().await.unwrap();
        assert_eq!(msg.channel, "user:u1");
        assert_eq!(msg.payload, "hello");
    }
}
