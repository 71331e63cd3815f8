//! Cross-instance relay for ephemeral frames (typing, presence, warnings)
//! over the presence store's pub/sub.

use super::RelayOutcome;
use crate::metrics;
use crate::presence::{
    conversation_channel, user_channel, PresenceStore, PubSubMessage, CONVERSATION_CHANNEL_PREFIX,
    RELAY_PATTERNS, USER_CHANNEL_PREFIX,
};
use crate::websocket::{Audience, ConnectionHub, RelayRequest};
use futures::StreamExt;
use resilience::{Backoff, RetryConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const SOURCE: &str = "pubsub";

/// Wire wrapper so subscribers can ignore frames from their own instance.
#[derive(Debug, Serialize, Deserialize)]
struct RelayedFrame {
    origin: String,
    payload: String,
}

#[derive(Clone)]
pub struct PubSubRelay {
    presence: Arc<dyn PresenceStore>,
    hub: ConnectionHub,
    instance_id: String,
}

impl PubSubRelay {
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        hub: ConnectionHub,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            presence,
            hub,
            instance_id: instance_id.into(),
        }
    }

    /// Drain the hub's relay queue until every sender is gone.
    pub async fn run_publisher(self, mut requests: mpsc::Receiver<RelayRequest>) {
        while let Some(request) = requests.recv().await {
            self.publish(&request).await;
        }
        debug!("Pub/sub publisher stopped");
    }

    /// Best effort: failures are counted and logged, never retried.
    pub async fn publish(&self, request: &RelayRequest) -> bool {
        let channel = match &request.audience {
            Audience::Conversation(id) => conversation_channel(id),
            Audience::User(id) => user_channel(id),
        };
        let body = match serde_json::to_string(&RelayedFrame {
            origin: self.instance_id.clone(),
            payload: request.frame.to_string(),
        }) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to encode relayed frame");
                return false;
            }
        };

        match self.presence.publish(&channel, &body).await {
            Ok(()) => true,
            Err(e) => {
                metrics::record_pubsub_failure();
                warn!(%channel, error = %e, "Cross-instance publish failed");
                false
            }
        }
    }

    pub async fn run_subscriber(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(&RetryConfig {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            ..RetryConfig::default()
        });

        'outer: loop {
            let mut stream = match self.presence.subscribe(&RELAY_PATTERNS).await {
                Ok(stream) => {
                    backoff.reset();
                    info!(instance_id = %self.instance_id, "Pub/sub relay subscribed");
                    stream
                }
                Err(e) => {
                    metrics::record_pubsub_failure();
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Pub/sub subscribe failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.changed() => break 'outer,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break 'outer,
                    next = stream.next() => match next {
                        Some(message) => {
                            self.handle_message(&message).await;
                        }
                        None => {
                            metrics::record_pubsub_failure();
                            warn!("Pub/sub stream ended, resubscribing");
                            let delay = backoff.next_delay();
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => break,
                                _ = shutdown.changed() => break 'outer,
                            }
                        }
                    }
                }
            }
        }
        info!("Pub/sub relay stopped");
    }

    pub async fn handle_message(&self, message: &PubSubMessage) -> RelayOutcome {
        let audience = if let Some(id) = message.channel.strip_prefix(CONVERSATION_CHANNEL_PREFIX) {
            Audience::Conversation(id.to_string())
        } else if let Some(id) = message.channel.strip_prefix(USER_CHANNEL_PREFIX) {
            Audience::User(id.to_string())
        } else {
            metrics::record_relayed(SOURCE, "malformed");
            debug!(channel = %message.channel, "Ignoring message on unknown channel");
            return RelayOutcome::Malformed;
        };

        let relayed: RelayedFrame = match serde_json::from_str(&message.payload) {
            Ok(relayed) => relayed,
            Err(e) => {
                metrics::record_relayed(SOURCE, "malformed");
                warn!(channel = %message.channel, error = %e, "Skipping malformed relayed frame");
                return RelayOutcome::Malformed;
            }
        };

        if relayed.origin == self.instance_id {
            return RelayOutcome::OwnOrigin;
        }

        let report = self.hub.deliver(&audience, Arc::from(relayed.payload)).await;
        metrics::record_relayed(SOURCE, "delivered");
        RelayOutcome::Delivered(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::InMemoryPresenceStore;
    use crate::websocket::{ConnectionHandle, OutboundFrame};

    #[tokio::test]
    async fn frames_cross_instances_but_not_back() {
        let presence = Arc::new(InMemoryPresenceStore::new());
        let hub_a = ConnectionHub::new(0);
        let hub_b = ConnectionHub::new(0);
        let relay_a = PubSubRelay::new(presence.clone(), hub_a.clone(), "a");
        let relay_b = PubSubRelay::new(presence.clone(), hub_b.clone(), "b");

        let (on_a, mut rx_a) = ConnectionHandle::new("u1", "c1", 8);
        let (on_b, mut rx_b) = ConnectionHandle::new("u2", "c1", 8);
        hub_a.register(on_a).await;
        hub_b.register(on_b).await;

        let request = RelayRequest {
            audience: Audience::Conversation("c1".into()),
            frame: Arc::from(r#"{"event":"typing","data":{}}"#),
        };
        let mut stream = presence.subscribe(&RELAY_PATTERNS).await.unwrap();
        assert!(relay_a.publish(&request).await);
        let message = stream.next().await.unwrap();
        assert_eq!(message.channel, "conversation:c1");

        assert_eq!(relay_a.handle_message(&message).await, RelayOutcome::OwnOrigin);
        assert!(rx_a.try_recv().is_err());

        assert!(matches!(
            relay_b.handle_message(&message).await,
            RelayOutcome::Delivered(r) if r.delivered == 1
        ));
        assert_eq!(
            rx_b.try_recv().unwrap(),
            OutboundFrame::Text(Arc::from(r#"{"event":"typing","data":{}}"#))
        );
    }

    #[tokio::test]
    async fn backend_outage_is_reported_not_raised() {
        let presence = Arc::new(InMemoryPresenceStore::new());
        presence.set_unavailable(true);
        let relay = PubSubRelay::new(presence, ConnectionHub::new(0), "a");
        let request = RelayRequest {
            audience: Audience::User("u1".into()),
            frame: Arc::from("{}"),
        };
        assert!(!relay.publish(&request).await);
    }

    #[tokio::test]
    async fn unknown_channels_and_garbage_are_skipped() {
        let relay = PubSubRelay::new(
            Arc::new(InMemoryPresenceStore::new()),
            ConnectionHub::new(0),
            "a",
        );
        let odd = PubSubMessage {
            channel: "elsewhere".into(),
            payload: "{}".into(),
        };
        assert_eq!(relay.handle_message(&odd).await, RelayOutcome::Malformed);
        let garbage = PubSubMessage {
            channel: "user:u1".into(),
            payload: "nope".into(),
        };
        assert_eq!(relay.handle_message(&garbage).await, RelayOutcome::Malformed);
    }
}
