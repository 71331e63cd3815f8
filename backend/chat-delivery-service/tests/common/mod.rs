#![allow(dead_code)]

use async_trait::async_trait;
use chat_delivery_service::auth::StaticTokenVerifier;
use chat_delivery_service::config::{
    CacheConfig, Config, KafkaConfig, PipelineConfig, PresenceConfig, WebSocketConfig,
};
use chat_delivery_service::event_log::InMemoryEventLog;
use chat_delivery_service::state::{AppState, Backends, Relays};
use chat_delivery_service::websocket::{ConnectionHandle, FrameSink, OutboundFrame, SinkClosed};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const MASTER_KEY: [u8; 32] = [7u8; 32];

pub fn test_config(instance_id: &str) -> Config {
    Config {
        database_url: String::new(),
        redis_url: String::new(),
        port: 0,
        instance_id: instance_id.to_string(),
        encryption_master_key: MASTER_KEY,
        jwt_public_key_pem: String::new(),
        websocket: WebSocketConfig {
            outbound_queue_capacity: 16,
            write_timeout: Duration::from_millis(500),
            max_consecutive_drops: 4,
            ..Default::default()
        },
        kafka: KafkaConfig::default(),
        presence: PresenceConfig::default(),
        cache: CacheConfig {
            recent_size: 10,
            ..Default::default()
        },
        pipeline: PipelineConfig {
            publish_max_retries: 1,
            publish_initial_backoff: Duration::from_millis(1),
            publish_timeout: Duration::from_millis(200),
            store_timeout: Duration::from_secs(1),
        },
    }
}

/// Backends shared by every instance of a test fleet, with a typed handle on
/// the log so tests can inject publish failures.
pub struct Fleet {
    pub backends: Backends,
    pub log: Arc<InMemoryEventLog>,
}

impl Fleet {
    pub fn new() -> Self {
        let verifier = Arc::new(
            StaticTokenVerifier::new()
                .with_token("alice-token", "alice")
                .with_token("bob-token", "bob"),
        );
        let log = Arc::new(InMemoryEventLog::new());
        let backends = Backends {
            event_log: log.clone(),
            ..Backends::in_memory(verifier, 10)
        };
        Self { backends, log }
    }

    pub fn instance(&self, instance_id: &str) -> (AppState, Relays) {
        AppState::build(test_config(instance_id), self.backends.clone())
    }
}

/// Register an active connection directly with the hub.
pub async fn connect(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
) -> (ConnectionHandle, mpsc::Receiver<OutboundFrame>) {
    let (handle, rx) = ConnectionHandle::new(
        user_id,
        conversation_id,
        state.config.websocket.outbound_queue_capacity,
    );
    state.hub.register(handle.clone()).await;
    handle.activate();
    (handle, rx)
}

/// Next text frame, decoded. Panics after a second of silence.
pub async fn next_event(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound queue closed");
        if let OutboundFrame::Text(text) = frame {
            return serde_json::from_str(&text).expect("outbound frame is JSON");
        }
    }
}

/// Every text frame currently queued.
pub fn drain_events(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let OutboundFrame::Text(text) = frame {
            events.push(serde_json::from_str(&text).expect("outbound frame is JSON"));
        }
    }
    events
}

pub fn event_names(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e["event"].as_str().map(str::to_string))
        .collect()
}

/// Socket write half that forwards text frames to a channel.
pub struct ChannelSink {
    pub texts: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: &str) -> Result<(), SinkClosed> {
        self.texts.send(text.to_string()).map_err(|_| SinkClosed)
    }

    async fn send_ping(&mut self, _payload: &[u8]) -> Result<(), SinkClosed> {
        Ok(())
    }

    async fn send_pong(&mut self, _payload: &[u8]) -> Result<(), SinkClosed> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkClosed> {
        Ok(())
    }
}
