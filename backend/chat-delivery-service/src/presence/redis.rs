use super::{bounded, PresenceError, PresenceStore, PubSubMessage, PubSubStream};
use crate::models::{ConnectionMeta, PresenceRecord, PresenceStatus};
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// KEYS[1] = connection hash, KEYS[2] = presence hash
/// ARGV = connection_id, meta json, ttl secs, now
const ADD_CONNECTION_LUA: &str = r#"
local existing = redis.call('HLEN', KEYS[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
redis.call('HSET', KEYS[2], 'status', 'online', 'last_seen', ARGV[4])
redis.call('EXPIRE', KEYS[2], ARGV[3])
if existing == 0 then return 1 end
return 0
"#;

/// KEYS[1] = connection hash, KEYS[2] = presence hash
/// ARGV = connection_id, now
const REMOVE_CONNECTION_LUA: &str = r#"
redis.call('HDEL', KEYS[1], ARGV[1])
if redis.call('HLEN', KEYS[1]) == 0 then
    redis.call('DEL', KEYS[1])
    redis.call('HSET', KEYS[2], 'status', 'offline', 'last_seen', ARGV[2])
    redis.call('PERSIST', KEYS[2])
    return 1
end
return 0
"#;

fn connections_key(user_id: &str) -> String {
    format!("presence:conns:{user_id}")
}

fn presence_key(user_id: &str) -> String {
    format!("presence:user:{user_id}")
}

/// Presence backed by two Redis hashes per user plus Redis pub/sub.
#[derive(Clone)]
pub struct RedisPresenceStore {
    redis: RedisClient,
    call_timeout: Duration,
}

impl RedisPresenceStore {
    pub fn new(redis: RedisClient, call_timeout: Duration) -> Self {
        Self {
            redis,
            call_timeout,
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_connection(
        &self,
        user_id: &str,
        meta: ConnectionMeta,
        ttl: Duration,
    ) -> Result<bool, PresenceError> {
        let meta_json =
            serde_json::to_string(&meta).map_err(|e| PresenceError::Corrupt(e.to_string()))?;
        bounded(self.call_timeout, async {
            let mut conn = self.redis.connection().await?;
            let first: i64 = Script::new(ADD_CONNECTION_LUA)
                .key(connections_key(user_id))
                .key(presence_key(user_id))
                .arg(&meta.connection_id)
                .arg(&meta_json)
                .arg(ttl.as_secs().max(1))
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, redis::RedisError>(first == 1)
        })
        .await
    }

    async fn remove_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<bool, PresenceError> {
        bounded(self.call_timeout, async {
            let mut conn = self.redis.connection().await?;
            let last: i64 = Script::new(REMOVE_CONNECTION_LUA)
                .key(connections_key(user_id))
                .key(presence_key(user_id))
                .arg(connection_id)
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, redis::RedisError>(last == 1)
        })
        .await
    }

    async fn refresh(&self, user_id: &str, ttl: Duration) -> Result<(), PresenceError> {
        let ttl_secs = ttl.as_secs().max(1) as i64;
        bounded(self.call_timeout, async {
            let mut conn = self.redis.connection().await?;
            redis::pipe()
                .atomic()
                .expire(connections_key(user_id), ttl_secs)
                .hset_multiple(
                    presence_key(user_id),
                    &[
                        ("status", PresenceStatus::Online.as_str().to_string()),
                        ("last_seen", Utc::now().to_rfc3339()),
                    ],
                )
                .expire(presence_key(user_id), ttl_secs)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>, PresenceError> {
        let fields: HashMap<String, String> = bounded(self.call_timeout, async {
            let mut conn = self.redis.connection().await?;
            conn.hgetall(presence_key(user_id)).await
        })
        .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let status = match fields.get("status").map(String::as_str) {
            Some("online") => PresenceStatus::Online,
            Some("offline") => PresenceStatus::Offline,
            other => {
                return Err(PresenceError::Corrupt(format!(
                    "unknown status {other:?} for {user_id}"
                )))
            }
        };
        let last_seen = fields
            .get("last_seen")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| PresenceError::Corrupt(format!("missing last_seen for {user_id}")))?;

        Ok(Some(PresenceRecord {
            user_id: user_id.to_string(),
            status,
            last_seen,
        }))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PresenceError> {
        bounded(self.call_timeout, async {
            let mut conn = self.redis.connection().await?;
            conn.publish::<_, _, ()>(channel, payload).await
        })
        .await
    }

    async fn subscribe(&self, patterns: &[&str]) -> Result<PubSubStream, PresenceError> {
        let pubsub = bounded(self.call_timeout, async {
            let mut pubsub = self.redis.pubsub().await?;
            for pattern in patterns {
                pubsub.psubscribe(*pattern).await?;
            }
            Ok::<_, redis::RedisError>(pubsub)
        })
        .await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(PubSubMessage { channel, payload }),
                Err(e) => {
                    warn!(%channel, error = %e, "dropping non-text pub/sub payload");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
