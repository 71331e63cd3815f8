use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Shared Redis handle. The connection manager is created on first use so a
/// Redis outage at startup only degrades presence, pub/sub and caching.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    manager: Arc<OnceCell<ConnectionManager>>,
}

impl RedisClient {
    pub fn open(url: &str) -> RedisResult<Self> {
        Ok(Self {
            client: Client::open(url)?,
            manager: Arc::new(OnceCell::new()),
        })
    }

    /// Multiplexed connection for commands; reconnects transparently once established.
    pub async fn connection(&self) -> RedisResult<ConnectionManager> {
        let client = self.client.clone();
        let manager = self
            .manager
            .get_or_try_init(|| async move { ConnectionManager::new(client).await })
            .await?;
        Ok(manager.clone())
    }

    /// Pub/sub needs a dedicated connection, not the multiplexed one.
    pub async fn pubsub(&self) -> RedisResult<redis::aio::PubSub> {
        self.client.get_async_pubsub().await
    }
}
