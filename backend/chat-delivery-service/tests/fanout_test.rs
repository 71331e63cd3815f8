mod common;

use async_trait::async_trait;
use chat_delivery_service::error::{AppError, AppResult};
use chat_delivery_service::event_log::EventLog;
use chat_delivery_service::models::{Message, NewMessage, PresenceStatus};
use chat_delivery_service::presence::{InMemoryPresenceStore, PresenceStore};
use chat_delivery_service::services::{RecentMessageCache, RelayOutcome};
use chat_delivery_service::state::{AppState, Backends};
use chat_delivery_service::websocket::{
    run_session, ConnectionHandle, ConnectionState, FrameSink, InboundFrame, SinkClosed,
};
use common::{connect, drain_events, event_names, next_event, test_config, ChannelSink, Fleet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

async fn with_members(state: &AppState, conversation_id: &str, members: &[&str]) {
    let (creator, rest) = members.split_first().expect("at least one member");
    state
        .conversations
        .ensure_exists(conversation_id, creator)
        .await
        .unwrap();
    for member in rest {
        state
            .conversations
            .add_member(conversation_id, member)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn conversation_members_receive_created_message() {
    let fleet = Fleet::new();
    let (state, _relays) = fleet.instance("node-a");
    with_members(&state, "c1", &["alice", "bob"]).await;

    let (alice, mut alice_rx) = connect(&state, "alice", "c1").await;
    let (_bob, mut bob_rx) = connect(&state, "bob", "c1").await;

    state
        .dispatcher
        .handle_text(&alice, r#"{"type":"message","payload":{"content":"hi"}}"#)
        .await;

    let to_alice = next_event(&mut alice_rx).await;
    let to_bob = next_event(&mut bob_rx).await;
    assert_eq!(to_alice["event"], "message_created");
    assert_eq!(to_bob["event"], "message_created");
    assert_eq!(to_bob["data"]["content"], "hi");
    assert_eq!(to_bob["data"]["sender_id"], "alice");
    assert_eq!(to_alice["data"]["id"], to_bob["data"]["id"]);

    assert_eq!(fleet.log.published().len(), 1);
    assert!(drain_events(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn invalid_envelope_answers_sender_only() {
    let fleet = Fleet::new();
    let (state, _relays) = fleet.instance("node-a");
    with_members(&state, "c1", &["alice", "bob"]).await;

    let (alice, mut alice_rx) = connect(&state, "alice", "c1").await;
    let (_bob, mut bob_rx) = connect(&state, "bob", "c1").await;

    state.dispatcher.handle_text(&alice, "not json").await;
    state
        .dispatcher
        .handle_text(&alice, r#"{"type":"read","payload":{"message_id":""}}"#)
        .await;

    let events = drain_events(&mut alice_rx);
    assert_eq!(event_names(&events), vec!["error", "error"]);
    assert_eq!(alice.state(), ConnectionState::Active);
    assert!(drain_events(&mut bob_rx).is_empty());
    assert!(fleet.log.published().is_empty());
}

#[tokio::test]
async fn sending_into_a_foreign_conversation_is_forbidden() {
    let fleet = Fleet::new();
    let (state, _relays) = fleet.instance("node-a");
    with_members(&state, "c1", &["alice"]).await;
    with_members(&state, "private", &["bob"]).await;

    let (alice, mut alice_rx) = connect(&state, "alice", "c1").await;
    state
        .dispatcher
        .handle_text(
            &alice,
            r#"{"type":"message","payload":{"content":"hi","conversation_id":"private"}}"#,
        )
        .await;

    let error = next_event(&mut alice_rx).await;
    assert_eq!(error["event"], "error");
    assert_eq!(error["data"]["code"], "forbidden");
    assert!(fleet.log.published().is_empty());
}

#[tokio::test]
async fn slow_consumer_does_not_block_others() {
    let fleet = Fleet::new();
    let (state, _relays) = fleet.instance("node-a");

    let (slow, _slow_rx) = ConnectionHandle::new("slow", "c1", 1);
    state.hub.register(slow.clone()).await;
    slow.activate();
    let (_fast, mut fast_rx) = connect(&state, "fast", "c1").await;

    let mut dropped = 0;
    let mut evicted = 0;
    for i in 0..10 {
        let report = state
            .hub
            .deliver_to_conversation("c1", Arc::from(format!(r#"{{"event":"typing","n":{i}}}"#)))
            .await;
        dropped += report.dropped;
        evicted += report.evicted;
    }

    assert_eq!(drain_events(&mut fast_rx).len(), 10);
    assert_eq!(dropped, 9);
    assert_eq!(evicted, 1);
    assert_eq!(slow.state(), ConnectionState::Draining);
}

#[tokio::test]
async fn hub_indices_stay_consistent() {
    let fleet = Fleet::new();
    let (state, _relays) = fleet.instance("node-a");

    let (a1, _rx1) = connect(&state, "alice", "c1").await;
    let (a2, _rx2) = connect(&state, "alice", "c2").await;
    let (b1, _rx3) = connect(&state, "bob", "c1").await;

    assert_eq!(state.hub.connection_count().await, 3);
    assert_eq!(state.hub.conversation_connection_count("c1").await, 2);
    assert_eq!(state.hub.user_connection_count("alice").await, 2);
    assert_eq!(state.hub.index_sizes().await, (2, 2));

    assert!(state.hub.unregister(&a1).await);
    assert_eq!(state.hub.user_connection_count("alice").await, 1);
    assert!(state.hub.unregister(&a2).await);
    assert!(state.hub.unregister(&b1).await);
    assert!(!state.hub.unregister(&b1).await);

    assert_eq!(state.hub.connection_count().await, 0);
    assert_eq!(state.hub.index_sizes().await, (0, 0));
}

#[tokio::test]
async fn session_announces_presence_and_cleans_up() {
    let fleet = Fleet::new();
    let (state, _relays) = fleet.instance("node-a");
    with_members(&state, "c1", &["alice", "bob"]).await;
    let (_bob, mut bob_rx) = connect(&state, "bob", "c1").await;

    let (handle, rx) = ConnectionHandle::new("alice", "c1", 16);
    let (texts_tx, mut texts_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Result<InboundFrame, String>>();

    let session = run_session(
        state.session_context(),
        handle.clone(),
        rx,
        ChannelSink { texts: texts_tx },
        UnboundedReceiverStream::new(inbound_rx),
    );

    let driver = async {
        let online = next_event(&mut bob_rx).await;
        assert_eq!(online["event"], "presence");
        assert_eq!(online["data"]["status"], "online");
        assert_eq!(state.hub.user_connection_count("alice").await, 1);

        inbound_tx
            .send(Ok(InboundFrame::Text(
                r#"{"type":"message","payload":{"content":"hello"}}"#.into(),
            )))
            .unwrap();
        let created = next_event(&mut bob_rx).await;
        assert_eq!(created["event"], "message_created");
        assert_eq!(created["data"]["content"], "hello");

        // The socket sees its own message too.
        loop {
            let text = tokio::time::timeout(Duration::from_secs(1), texts_rx.recv())
                .await
                .unwrap()
                .unwrap();
            let event: serde_json::Value = serde_json::from_str(&text).unwrap();
            if event["event"] == "message_created" {
                break;
            }
        }

        inbound_tx.send(Ok(InboundFrame::Close)).unwrap();
    };

    tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(session, driver) })
        .await
        .expect("session did not shut down");

    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(state.hub.user_connection_count("alice").await, 0);
    assert_eq!(state.hub.connection_count().await, 1);

    let offline = next_event(&mut bob_rx).await;
    assert_eq!(offline["event"], "presence");
    assert_eq!(offline["data"]["status"], "offline");

    let record = state.presence.get_presence("alice").await.unwrap().unwrap();
    assert_eq!(record.status, PresenceStatus::Offline);
}

#[tokio::test]
async fn message_events_cross_instances_through_the_log() {
    let fleet = Fleet::new();
    let (node_a, relays_a) = fleet.instance("node-a");
    let (node_b, relays_b) = fleet.instance("node-b");
    with_members(&node_a, "c1", &["alice", "bob"]).await;

    let (_alice, mut alice_rx) = connect(&node_a, "alice", "c1").await;
    let (_bob, mut bob_rx) = connect(&node_b, "bob", "c1").await;
    let mut subscription = fleet.log.subscribe().await.unwrap();

    let outcome = node_a
        .commands
        .create_message(NewMessage {
            conversation_id: "c1".into(),
            sender_id: "alice".into(),
            content: "across".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let record = subscription.next_record().await.unwrap().unwrap();
    assert_eq!(record.key, "c1");
    assert_eq!(record.event_type.as_deref(), Some("message.new"));

    assert_eq!(relays_a.events.handle_record(&record).await, RelayOutcome::OwnOrigin);
    match relays_b.events.handle_record(&record).await {
        RelayOutcome::Delivered(report) => assert_eq!(report.delivered, 1),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let on_b = next_event(&mut bob_rx).await;
    assert_eq!(on_b["event"], "message_created");
    assert_eq!(on_b["data"]["id"], outcome.value.id.as_str());
    assert_eq!(on_b["data"]["content"], "across");

    // Local delivery on the origin happened exactly once.
    let on_a = drain_events(&mut alice_rx);
    assert_eq!(event_names(&on_a), vec!["message_created"]);
}

/// Recency cache whose backend is down.
struct DownCache;

#[async_trait]
impl RecentMessageCache for DownCache {
    async fn push(&self, _message: &Message) -> AppResult<()> {
        Err(AppError::ServiceUnavailable("cache down".into()))
    }

    async fn recent(&self, _conversation_id: &str, _limit: usize) -> AppResult<Vec<Message>> {
        Err(AppError::ServiceUnavailable("cache down".into()))
    }

    async fn invalidate(&self, _conversation_id: &str) -> AppResult<()> {
        Err(AppError::ServiceUnavailable("cache down".into()))
    }
}

#[tokio::test]
async fn local_delivery_survives_cache_and_presence_outage() {
    let fleet = Fleet::new();
    let presence = Arc::new(InMemoryPresenceStore::new());
    presence.set_unavailable(true);
    let backends = Backends {
        presence: presence.clone(),
        cache: Arc::new(DownCache),
        ..fleet.backends.clone()
    };
    let (state, _relays) = AppState::build(test_config("node-a"), backends);
    with_members(&state, "c1", &["alice", "bob"]).await;
    let (_bob, mut bob_rx) = connect(&state, "bob", "c1").await;

    let (handle, rx) = ConnectionHandle::new("alice", "c1", 16);
    let (texts_tx, _texts_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Result<InboundFrame, String>>();
    let session = run_session(
        state.session_context(),
        handle.clone(),
        rx,
        ChannelSink { texts: texts_tx },
        UnboundedReceiverStream::new(inbound_rx),
    );

    let driver = async {
        inbound_tx
            .send(Ok(InboundFrame::Text(
                r#"{"type":"message","payload":{"content":"still here"}}"#.into(),
            )))
            .unwrap();
        let created = next_event(&mut bob_rx).await;
        assert_eq!(created["event"], "message_created");
        assert_eq!(created["data"]["content"], "still here");
        inbound_tx.send(Ok(InboundFrame::Close)).unwrap();
    };

    tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(session, driver) })
        .await
        .expect("session did not shut down");

    // No presence event could be announced with the backend down.
    assert!(drain_events(&mut bob_rx).is_empty());
    assert_eq!(fleet.log.published().len(), 1);
    let page = state.queries.get_messages("c1", 0, None, None).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content.as_deref(), Some("still here"));
}

/// Socket write half that reports pongs and ignores everything else.
struct PongSink {
    pongs: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl FrameSink for PongSink {
    async fn send_text(&mut self, _text: &str) -> Result<(), SinkClosed> {
        Ok(())
    }

    async fn send_ping(&mut self, _payload: &[u8]) -> Result<(), SinkClosed> {
        Ok(())
    }

    async fn send_pong(&mut self, payload: &[u8]) -> Result<(), SinkClosed> {
        self.pongs.send(payload.to_vec()).map_err(|_| SinkClosed)
    }

    async fn close(&mut self) -> Result<(), SinkClosed> {
        Ok(())
    }
}

#[tokio::test]
async fn client_ping_is_answered_with_pong() {
    let fleet = Fleet::new();
    let (state, _relays) = fleet.instance("node-a");

    let (handle, rx) = ConnectionHandle::new("alice", "c1", 16);
    let (pongs_tx, mut pongs_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Result<InboundFrame, String>>();
    let session = run_session(
        state.session_context(),
        handle.clone(),
        rx,
        PongSink { pongs: pongs_tx },
        UnboundedReceiverStream::new(inbound_rx),
    );

    let driver = async {
        inbound_tx
            .send(Ok(InboundFrame::Ping(b"are-you-there".to_vec())))
            .unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(1), pongs_rx.recv())
            .await
            .expect("no pong")
            .unwrap();
        assert_eq!(pong, b"are-you-there".to_vec());
        inbound_tx.send(Ok(InboundFrame::Close)).unwrap();
    };

    tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(session, driver) })
        .await
        .expect("session did not shut down");
    assert_eq!(handle.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn shutdown_drains_live_sessions() {
    let fleet = Fleet::new();
    let (state, _relays) = fleet.instance("node-a");

    let (handle, rx) = ConnectionHandle::new("alice", "c1", 16);
    let (texts_tx, _texts_rx) = mpsc::unbounded_channel();
    // The client never closes; only shutdown ends the session.
    let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Result<InboundFrame, String>>();
    let session = run_session(
        state.session_context(),
        handle.clone(),
        rx,
        ChannelSink { texts: texts_tx },
        UnboundedReceiverStream::new(inbound_rx),
    );

    let driver = async {
        while state.hub.user_connection_count("alice").await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Registered connections are already active, so shutdown reaches them.
        assert_eq!(handle.state(), ConnectionState::Active);
        assert_eq!(state.hub.shutdown().await, 1);
    };

    tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(session, driver) })
        .await
        .expect("shutdown did not end the session");
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(state.hub.connection_count().await, 0);
}
