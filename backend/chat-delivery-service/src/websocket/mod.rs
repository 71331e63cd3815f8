use crate::metrics;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

pub mod connection;
pub mod events;
pub mod handlers;
pub mod message_types;

pub use connection::{
    run_session, ConnectionHandle, ConnectionState, FrameSink, InboundFrame, OutboundFrame,
    SessionContext, SinkClosed,
};
pub use events::OutboundEvent;
pub use handlers::Dispatcher;
pub use message_types::{InboundEnvelope, InboundError};

/// Unique identifier for one live socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who a frame is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Conversation(String),
    User(String),
}

/// A frame handed to the cross-instance relay after local delivery.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub audience: Audience,
    pub frame: Arc<str>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Frames not enqueued because the queue was full or already closed
    pub dropped: usize,
    /// Connections moved to draining by this broadcast
    pub evicted: usize,
}

type Bucket = HashMap<ConnectionId, ConnectionHandle>;

#[derive(Default)]
struct HubIndex {
    by_conversation: HashMap<String, Bucket>,
    by_user: HashMap<String, Bucket>,
}

/// Per-process registry of live connections, indexed by conversation and by user.
///
/// Both indices live behind one lock. Broadcast only takes the read lock and
/// never awaits while holding it: delivery is a non-blocking `try_send`, so a
/// stuck consumer cannot stall anybody else.
#[derive(Clone)]
pub struct ConnectionHub {
    index: Arc<RwLock<HubIndex>>,
    relay: Option<mpsc::Sender<RelayRequest>>,
    max_consecutive_drops: u32,
}

impl ConnectionHub {
    pub fn new(max_consecutive_drops: u32) -> Self {
        Self {
            index: Arc::new(RwLock::new(HubIndex::default())),
            relay: None,
            max_consecutive_drops,
        }
    }

    /// Hand every `broadcast_*` frame to `relay` after local delivery.
    pub fn with_relay(mut self, relay: mpsc::Sender<RelayRequest>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub async fn register(&self, handle: ConnectionHandle) {
        let mut guard = self.index.write().await;
        guard
            .by_conversation
            .entry(handle.conversation_id().to_string())
            .or_default()
            .insert(handle.id(), handle.clone());
        guard
            .by_user
            .entry(handle.user_id().to_string())
            .or_default()
            .insert(handle.id(), handle.clone());

        debug!(
            connection_id = %handle.id(),
            user_id = %handle.user_id(),
            conversation_id = %handle.conversation_id(),
            conversation_connections = guard
                .by_conversation
                .get(handle.conversation_id())
                .map(|b| b.len())
                .unwrap_or(0),
            "Registered connection"
        );
    }

    /// Remove from both indices, pruning any index entry left empty.
    /// Returns false if the connection was not registered.
    pub async fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut guard = self.index.write().await;
        let removed_conv = remove_from(
            &mut guard.by_conversation,
            handle.conversation_id(),
            handle.id(),
        );
        let removed_user = remove_from(&mut guard.by_user, handle.user_id(), handle.id());

        if removed_conv || removed_user {
            debug!(
                connection_id = %handle.id(),
                user_id = %handle.user_id(),
                conversation_id = %handle.conversation_id(),
                "Unregistered connection"
            );
        }
        removed_conv || removed_user
    }

    /// Local fan-out to a conversation, then hand-off to the cross-instance relay.
    pub async fn broadcast_to_conversation(
        &self,
        conversation_id: &str,
        frame: Arc<str>,
    ) -> BroadcastReport {
        self.broadcast(&Audience::Conversation(conversation_id.to_string()), frame)
            .await
    }

    /// Local fan-out to a user's connections, then hand-off to the cross-instance relay.
    pub async fn send_to_user(&self, user_id: &str, frame: Arc<str>) -> BroadcastReport {
        self.broadcast(&Audience::User(user_id.to_string()), frame)
            .await
    }

    pub async fn broadcast(&self, audience: &Audience, frame: Arc<str>) -> BroadcastReport {
        let report = self.deliver(audience, frame.clone()).await;
        self.relay(audience, frame);
        report
    }

    /// Local fan-out only. Used by relays so a received frame is not re-relayed.
    pub async fn deliver(&self, audience: &Audience, frame: Arc<str>) -> BroadcastReport {
        let guard = self.index.read().await;
        let bucket = match audience {
            Audience::Conversation(id) => guard.by_conversation.get(id),
            Audience::User(id) => guard.by_user.get(id),
        };
        match bucket {
            Some(bucket) => self.offer_all(bucket.values(), &frame),
            None => BroadcastReport::default(),
        }
    }

    pub async fn deliver_to_conversation(
        &self,
        conversation_id: &str,
        frame: Arc<str>,
    ) -> BroadcastReport {
        self.deliver(&Audience::Conversation(conversation_id.to_string()), frame)
            .await
    }

    pub async fn deliver_to_user(&self, user_id: &str, frame: Arc<str>) -> BroadcastReport {
        self.deliver(&Audience::User(user_id.to_string()), frame)
            .await
    }

    fn offer_all<'a>(
        &self,
        handles: impl Iterator<Item = &'a ConnectionHandle>,
        frame: &Arc<str>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for handle in handles {
            match handle.offer(OutboundFrame::Text(frame.clone())) {
                connection::Offer::Delivered => {
                    report.delivered += 1;
                    metrics::record_frame("delivered");
                }
                connection::Offer::Dropped { consecutive } => {
                    report.dropped += 1;
                    let evict = self.max_consecutive_drops > 0
                        && consecutive >= self.max_consecutive_drops;
                    if evict && handle.begin_draining() {
                        report.evicted += 1;
                        metrics::record_frame("evicted");
                        warn!(
                            connection_id = %handle.id(),
                            user_id = %handle.user_id(),
                            consecutive,
                            "Evicting slow consumer"
                        );
                    } else {
                        metrics::record_frame("dropped");
                        debug!(
                            connection_id = %handle.id(),
                            consecutive,
                            "Outbound queue full, frame dropped"
                        );
                    }
                }
                connection::Offer::Closed => {
                    report.dropped += 1;
                    metrics::record_frame("closed");
                }
            }
        }
        report
    }

    fn relay(&self, audience: &Audience, frame: Arc<str>) {
        let Some(relay) = &self.relay else {
            return;
        };
        let request = RelayRequest {
            audience: audience.clone(),
            frame,
        };
        if let Err(e) = relay.try_send(request) {
            metrics::record_pubsub_failure();
            warn!(
                audience = ?audience,
                error = %e,
                "Cross-instance relay queue unavailable, frame not relayed"
            );
        }
    }

    /// Move every registered connection to draining so writers flush and close.
    pub async fn shutdown(&self) -> usize {
        let guard = self.index.read().await;
        let drained = guard
            .by_user
            .values()
            .flat_map(|bucket| bucket.values())
            .filter(|handle| handle.begin_draining())
            .count();
        tracing::info!(drained, "Connection hub shut down");
        drained
    }

    pub async fn connection_count(&self) -> usize {
        let guard = self.index.read().await;
        guard.by_user.values().map(|b| b.len()).sum()
    }

    pub async fn conversation_connection_count(&self, conversation_id: &str) -> usize {
        let guard = self.index.read().await;
        guard
            .by_conversation
            .get(conversation_id)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    pub async fn user_connection_count(&self, user_id: &str) -> usize {
        let guard = self.index.read().await;
        guard.by_user.get(user_id).map(|b| b.len()).unwrap_or(0)
    }

    /// Number of conversation and user index entries; empty entries never linger.
    pub async fn index_sizes(&self) -> (usize, usize) {
        let guard = self.index.read().await;
        (guard.by_conversation.len(), guard.by_user.len())
    }
}

fn remove_from(map: &mut HashMap<String, Bucket>, key: &str, id: ConnectionId) -> bool {
    let Some(bucket) = map.get_mut(key) else {
        return false;
    };
    let removed = bucket.remove(&id).is_some();
    if bucket.is_empty() {
        map.remove(key);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    async fn expect_text(rx: &mut mpsc::Receiver<OutboundFrame>, expected: &str) {
        match rx.try_recv() {
            Ok(OutboundFrame::Text(text)) => assert_eq!(&*text, expected),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_exactly_registered_connections() {
        let hub = ConnectionHub::new(0);
        let (a, mut rx_a) = ConnectionHandle::new("u1", "c1", 8);
        let (b, mut rx_b) = ConnectionHandle::new("u2", "c1", 8);
        let (other, mut rx_other) = ConnectionHandle::new("u3", "c2", 8);
        hub.register(a.clone()).await;
        hub.register(b.clone()).await;
        hub.register(other.clone()).await;

        let report = hub.broadcast_to_conversation("c1", frame("one")).await;
        assert_eq!(report.delivered, 2);
        expect_text(&mut rx_a, "one").await;
        expect_text(&mut rx_b, "one").await;
        assert!(rx_other.try_recv().is_err());

        assert!(hub.unregister(&b).await);
        let report = hub.broadcast_to_conversation("c1", frame("two")).await;
        assert_eq!(report.delivered, 1);
        expect_text(&mut rx_a, "two").await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_prunes_empty_entries() {
        let hub = ConnectionHub::new(0);
        let (a, _rx) = ConnectionHandle::new("u1", "c1", 8);
        hub.register(a.clone()).await;
        assert_eq!(hub.index_sizes().await, (1, 1));

        assert!(hub.unregister(&a).await);
        assert!(!hub.unregister(&a).await);
        assert_eq!(hub.index_sizes().await, (0, 0));
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn send_to_user_spans_conversations() {
        let hub = ConnectionHub::new(0);
        let (a, mut rx_a) = ConnectionHandle::new("u1", "c1", 8);
        let (b, mut rx_b) = ConnectionHandle::new("u1", "c2", 8);
        hub.register(a).await;
        hub.register(b).await;

        let report = hub.send_to_user("u1", frame("hey")).await;
        assert_eq!(report.delivered, 2);
        expect_text(&mut rx_a, "hey").await;
        expect_text(&mut rx_b, "hey").await;
        assert_eq!(hub.user_connection_count("u1").await, 2);
    }

    #[tokio::test]
    async fn full_queue_drops_without_affecting_others() {
        let hub = ConnectionHub::new(0);
        let (slow, _slow_rx) = ConnectionHandle::new("u1", "c1", 1);
        let (fast, mut fast_rx) = ConnectionHandle::new("u2", "c1", 8);
        hub.register(slow.clone()).await;
        hub.register(fast).await;

        hub.deliver_to_conversation("c1", frame("1")).await;
        let report = hub.deliver_to_conversation("c1", frame("2")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(slow.state(), ConnectionState::Connecting);

        expect_text(&mut fast_rx, "1").await;
        expect_text(&mut fast_rx, "2").await;
    }

    #[tokio::test]
    async fn consecutive_drops_evict() {
        let hub = ConnectionHub::new(3);
        let (slow, _rx) = ConnectionHandle::new("u1", "c1", 1);
        assert!(slow.activate());
        hub.register(slow.clone()).await;

        hub.deliver_to_conversation("c1", frame("fill")).await;
        let mut evicted = 0;
        for _ in 0..3 {
            evicted += hub.deliver_to_conversation("c1", frame("x")).await.evicted;
        }
        assert_eq!(evicted, 1);
        assert_eq!(slow.state(), ConnectionState::Draining);
    }

    #[tokio::test]
    async fn successful_delivery_resets_drop_counter() {
        let hub = ConnectionHub::new(2);
        let (conn, mut rx) = ConnectionHandle::new("u1", "c1", 1);
        assert!(conn.activate());
        hub.register(conn.clone()).await;

        hub.deliver_to_conversation("c1", frame("a")).await;
        hub.deliver_to_conversation("c1", frame("dropped")).await;
        rx.try_recv().unwrap();
        hub.deliver_to_conversation("c1", frame("b")).await;
        hub.deliver_to_conversation("c1", frame("dropped")).await;
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn broadcast_hands_off_to_relay_but_deliver_does_not() {
        let (tx, mut relay_rx) = mpsc::channel(4);
        let hub = ConnectionHub::new(0).with_relay(tx);

        hub.deliver_to_conversation("c1", frame("local")).await;
        assert!(relay_rx.try_recv().is_err());

        hub.broadcast_to_conversation("c1", frame("both")).await;
        let request = relay_rx.try_recv().unwrap();
        assert_eq!(request.audience, Audience::Conversation("c1".into()));
        assert_eq!(&*request.frame, "both");
    }

    #[tokio::test]
    async fn full_relay_queue_does_not_block_broadcast() {
        let (tx, _relay_rx) = mpsc::channel(1);
        let hub = ConnectionHub::new(0).with_relay(tx);
        let (a, mut rx) = ConnectionHandle::new("u1", "c1", 8);
        hub.register(a).await;

        hub.broadcast_to_conversation("c1", frame("1")).await;
        let report = hub.broadcast_to_conversation("c1", frame("2")).await;
        assert_eq!(report.delivered, 1);
        expect_text(&mut rx, "1").await;
        expect_text(&mut rx, "2").await;
    }

    #[tokio::test]
    async fn shutdown_drains_everyone() {
        let hub = ConnectionHub::new(0);
        let (a, _ra) = ConnectionHandle::new("u1", "c1", 8);
        let (b, _rb) = ConnectionHandle::new("u2", "c1", 8);
        assert!(a.activate());
        assert!(b.activate());
        hub.register(a.clone()).await;
        hub.register(b.clone()).await;

        assert_eq!(hub.shutdown().await, 2);
        assert_eq!(a.state(), ConnectionState::Draining);
        assert_eq!(b.state(), ConnectionState::Draining);
    }
}
