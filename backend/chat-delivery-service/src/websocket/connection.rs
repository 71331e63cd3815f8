//! Connection lifecycle: state machine, outbound queue and the session loops.
//!
//! Every socket gets a dedicated writer that owns the sink and drains a bounded
//! queue, plus a reader that dispatches inbound frames. Neither ever blocks on
//! the other, and the hub only ever touches the queue.

use super::events::{OutboundEvent, PresenceData};
use super::handlers::Dispatcher;
use super::{ConnectionHub, ConnectionId};
use crate::config::{PresenceConfig, WebSocketConfig};
use crate::metrics;
use crate::models::{ConnectionMeta, PresenceStatus};
use crate::presence::PresenceStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl ConnectionState {
    /// Allowed: Connecting→Active, Connecting→Closed, Active→Draining, Draining→Closed.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Active) | (Connecting, Closed) | (Active, Draining) | (Draining, Closed)
        )
    }

    pub fn is_winding_down(self) -> bool {
        matches!(self, ConnectionState::Draining | ConnectionState::Closed)
    }
}

/// Shared, observable connection state.
#[derive(Clone)]
pub struct StateCell {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StateCell {
    fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Connecting);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Apply `next` if the transition is allowed. Returns whether it was applied.
    pub fn transition(&self, next: ConnectionState) -> bool {
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(Arc<str>),
    Pong(Vec<u8>),
}

/// Result of offering a frame to a connection's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Delivered,
    Dropped { consecutive: u32 },
    Closed,
}

/// Cheap handle to a live connection: identity, queue sender and state.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: Arc<str>,
    conversation_id: Arc<str>,
    sender: mpsc::Sender<OutboundFrame>,
    state: StateCell,
    consecutive_drops: Arc<AtomicU32>,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(
        user_id: &str,
        conversation_id: &str,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (sender, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            user_id: Arc::from(user_id),
            conversation_id: Arc::from(conversation_id),
            sender,
            state: StateCell::new(),
            consecutive_drops: Arc::new(AtomicU32::new(0)),
            connected_at: Utc::now(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub fn activate(&self) -> bool {
        self.state.transition(ConnectionState::Active)
    }

    pub fn begin_draining(&self) -> bool {
        self.state.transition(ConnectionState::Draining)
    }

    /// Closed is terminal; reachable from Connecting or Draining.
    pub fn mark_closed(&self) -> bool {
        self.state.transition(ConnectionState::Closed)
    }

    /// Non-blocking enqueue. A full queue counts as a drop.
    pub fn offer(&self, frame: OutboundFrame) -> Offer {
        if self.state().is_winding_down() {
            return Offer::Closed;
        }
        match self.sender.try_send(frame) {
            Ok(()) => {
                self.consecutive_drops.store(0, Ordering::Relaxed);
                Offer::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => Offer::Dropped {
                consecutive: self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1,
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Queue an event for this connection only.
    pub fn push_event(&self, event: &OutboundEvent) -> Offer {
        match event.to_frame() {
            Ok(frame) => self.offer(OutboundFrame::Text(frame)),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Failed to encode outbound event");
                Offer::Closed
            }
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("conversation_id", &self.conversation_id)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close,
}

#[derive(Debug, Error)]
#[error("socket closed")]
pub struct SinkClosed;

/// Write half of a socket. Only the writer loop touches it.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), SinkClosed>;
    async fn send_ping(&mut self, payload: &[u8]) -> Result<(), SinkClosed>;
    async fn send_pong(&mut self, payload: &[u8]) -> Result<(), SinkClosed>;
    async fn close(&mut self) -> Result<(), SinkClosed>;
}

/// Everything a session needs besides its own socket.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: ConnectionHub,
    pub dispatcher: Arc<Dispatcher>,
    pub presence: Arc<dyn PresenceStore>,
    pub websocket: WebSocketConfig,
    pub presence_config: PresenceConfig,
    pub instance_id: String,
}

/// Last time anything arrived from the client.
struct Liveness(Mutex<Instant>);

impl Liveness {
    fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    fn touch(&self) {
        if let Ok(mut last) = self.0.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.0
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

/// Drive one connection from registration to cleanup.
pub async fn run_session<S, R, E>(
    ctx: SessionContext,
    handle: ConnectionHandle,
    rx: mpsc::Receiver<OutboundFrame>,
    sink: S,
    inbound: R,
) where
    S: FrameSink,
    R: Stream<Item = Result<InboundFrame, E>> + Unpin,
    E: Display,
{
    let meta = ConnectionMeta {
        connection_id: handle.id().to_string(),
        conversation_id: handle.conversation_id().to_string(),
        instance_id: ctx.instance_id.clone(),
        connected_at: handle.connected_at(),
    };
    let first_connection = match ctx
        .presence
        .add_connection(handle.user_id(), meta, ctx.presence_config.ttl)
        .await
    {
        Ok(first) => first,
        Err(e) => {
            warn!(user_id = %handle.user_id(), error = %e, "Presence unavailable on connect");
            false
        }
    };

    handle.activate();
    ctx.hub.register(handle.clone()).await;
    metrics::connection_opened();
    info!(
        connection_id = %handle.id(),
        user_id = %handle.user_id(),
        conversation_id = %handle.conversation_id(),
        "WebSocket connection active"
    );

    if first_connection {
        announce_presence(&ctx.hub, &handle, PresenceStatus::Online).await;
    }

    let liveness = Liveness::new();
    tokio::join!(
        read_loop(inbound, &handle, &ctx.dispatcher, &liveness),
        write_loop(sink, rx, &handle, &ctx.websocket, &liveness),
        presence_heartbeat(&handle, ctx.presence.as_ref(), &ctx.presence_config),
    );

    ctx.hub.unregister(&handle).await;
    metrics::connection_closed();

    match ctx
        .presence
        .remove_connection(handle.user_id(), &handle.id().to_string())
        .await
    {
        Ok(true) => announce_presence(&ctx.hub, &handle, PresenceStatus::Offline).await,
        Ok(false) => {}
        Err(e) => warn!(
            user_id = %handle.user_id(),
            error = %e,
            "Presence unavailable on disconnect"
        ),
    }

    info!(
        connection_id = %handle.id(),
        user_id = %handle.user_id(),
        "WebSocket connection closed"
    );
}

async fn announce_presence(hub: &ConnectionHub, handle: &ConnectionHandle, status: PresenceStatus) {
    let event = OutboundEvent::Presence(PresenceData {
        user_id: handle.user_id().to_string(),
        conversation_id: handle.conversation_id().to_string(),
        status,
        last_seen: Utc::now(),
    });
    match event.to_frame() {
        Ok(frame) => {
            hub.broadcast_to_conversation(handle.conversation_id(), frame)
                .await;
        }
        Err(e) => warn!(error = %e, "Failed to encode presence event"),
    }
}

async fn read_loop<R, E>(
    mut inbound: R,
    handle: &ConnectionHandle,
    dispatcher: &Dispatcher,
    liveness: &Liveness,
) where
    R: Stream<Item = Result<InboundFrame, E>> + Unpin,
    E: Display,
{
    let mut state_rx = handle.state_cell().subscribe();
    loop {
        if handle.state().is_winding_down() {
            break;
        }
        tokio::select! {
            item = inbound.next() => match item {
                Some(Ok(InboundFrame::Text(text))) => {
                    liveness.touch();
                    dispatcher.handle_text(handle, &text).await;
                }
                Some(Ok(InboundFrame::Ping(payload))) => {
                    liveness.touch();
                    handle.offer(OutboundFrame::Pong(payload));
                }
                Some(Ok(InboundFrame::Pong)) => liveness.touch(),
                Some(Ok(InboundFrame::Binary(_))) => {
                    liveness.touch();
                    metrics::record_inbound_rejected("binary");
                    debug!(connection_id = %handle.id(), "Ignoring binary frame");
                }
                Some(Ok(InboundFrame::Close)) => {
                    debug!(connection_id = %handle.id(), "Client closed connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(connection_id = %handle.id(), error = %e, "WebSocket protocol error");
                    break;
                }
                None => break,
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    handle.begin_draining();
}

async fn write_loop<S: FrameSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<OutboundFrame>,
    handle: &ConnectionHandle,
    config: &WebSocketConfig,
    liveness: &Liveness,
) {
    let mut state_rx = handle.state_cell().subscribe();
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    let mut healthy = true;

    loop {
        if handle.state().is_winding_down() {
            break;
        }
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if !write_frame(&mut sink, frame, config.write_timeout, handle).await {
                        healthy = false;
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                let idle = liveness.idle_for();
                if idle > config.client_timeout {
                    info!(
                        connection_id = %handle.id(),
                        idle_secs = idle.as_secs(),
                        "Client timed out"
                    );
                    break;
                }
                let sent = tokio::time::timeout(config.write_timeout, sink.send_ping(b"")).await;
                if !matches!(sent, Ok(Ok(()))) {
                    healthy = false;
                    break;
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    handle.begin_draining();
    if healthy {
        while let Ok(frame) = rx.try_recv() {
            if !write_frame(&mut sink, frame, config.write_timeout, handle).await {
                healthy = false;
                break;
            }
        }
    }
    if healthy {
        let _ = tokio::time::timeout(config.write_timeout, sink.close()).await;
    }
    rx.close();
    handle.mark_closed();
}

async fn write_frame<S: FrameSink>(
    sink: &mut S,
    frame: OutboundFrame,
    limit: Duration,
    handle: &ConnectionHandle,
) -> bool {
    let write = async {
        match &frame {
            OutboundFrame::Text(text) => sink.send_text(text).await,
            OutboundFrame::Pong(payload) => sink.send_pong(payload).await,
        }
    };
    match tokio::time::timeout(limit, write).await {
        Ok(Ok(())) => true,
        Ok(Err(SinkClosed)) => {
            debug!(connection_id = %handle.id(), "Socket closed during write");
            false
        }
        Err(_) => {
            metrics::record_frame("write_timeout");
            warn!(
                connection_id = %handle.id(),
                timeout_ms = limit.as_millis() as u64,
                "Write timed out"
            );
            false
        }
    }
}

async fn presence_heartbeat(
    handle: &ConnectionHandle,
    presence: &dyn PresenceStore,
    config: &PresenceConfig,
) {
    let period = config.refresh_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut state_rx = handle.state_cell().subscribe();
    loop {
        if handle.state().is_winding_down() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = presence.refresh(handle.user_id(), config.ttl).await {
                    debug!(user_id = %handle.user_id(), error = %e, "Presence refresh failed");
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
