use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::event_log::{EventLog, EventPublisher, InMemoryEventLog};
use crate::presence::{InMemoryPresenceStore, PresenceStore};
use crate::services::{
    CommandPipeline, ConversationService, EncryptionService, EventRelay, InMemoryRecentCache,
    PubSubRelay, QueryPipeline, RecentMessageCache,
};
use crate::store::{
    ConversationStore, InMemoryConversationStore, InMemoryMessageStore, MessageStore,
};
use crate::websocket::{ConnectionHub, Dispatcher, RelayRequest, SessionContext};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of the hub's hand-off queue to the pub/sub publisher.
const RELAY_QUEUE_CAPACITY: usize = 1024;

/// External collaborators, injected so tests can swap in-memory versions.
#[derive(Clone)]
pub struct Backends {
    pub messages: Arc<dyn MessageStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub cache: Arc<dyn RecentMessageCache>,
    pub event_log: Arc<dyn EventLog>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl Backends {
    /// Everything in process. Instances built from clones of one `Backends`
    /// share storage, presence and log, like a fleet sharing real backends.
    pub fn in_memory(verifier: Arc<dyn TokenVerifier>, cache_size: usize) -> Self {
        Self {
            messages: Arc::new(InMemoryMessageStore::new()),
            conversations: Arc::new(InMemoryConversationStore::new()),
            presence: Arc::new(InMemoryPresenceStore::new()),
            cache: Arc::new(InMemoryRecentCache::new(cache_size)),
            event_log: Arc::new(InMemoryEventLog::new()),
            verifier,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: ConnectionHub,
    pub commands: Arc<CommandPipeline>,
    pub queries: Arc<QueryPipeline>,
    pub conversations: ConversationService,
    pub dispatcher: Arc<Dispatcher>,
    pub presence: Arc<dyn PresenceStore>,
    pub verifier: Arc<dyn TokenVerifier>,
}

/// Background workers created alongside the state; the caller spawns them.
pub struct Relays {
    pub events: EventRelay,
    pub pubsub: PubSubRelay,
    pub pubsub_requests: mpsc::Receiver<RelayRequest>,
}

impl AppState {
    pub fn build(config: Config, backends: Backends) -> (Self, Relays) {
        let config = Arc::new(config);
        let (relay_tx, relay_rx) = mpsc::channel(RELAY_QUEUE_CAPACITY);
        let hub = ConnectionHub::new(config.websocket.max_consecutive_drops).with_relay(relay_tx);

        let encryption = EncryptionService::new(config.encryption_master_key);
        let conversations = ConversationService::new(backends.conversations.clone());
        let publisher = EventPublisher::new(
            backends.event_log.clone(),
            config.instance_id.clone(),
            config.pipeline.publish_retry(),
            config.pipeline.publish_timeout,
        );

        let commands = Arc::new(CommandPipeline::new(
            backends.messages.clone(),
            conversations.clone(),
            backends.cache.clone(),
            encryption.clone(),
            publisher,
            hub.clone(),
            config.pipeline.store_timeout,
        ));
        let queries = Arc::new(QueryPipeline::new(
            backends.messages.clone(),
            backends.cache.clone(),
            encryption.clone(),
            config.pipeline.store_timeout,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            commands.clone(),
            conversations.clone(),
            hub.clone(),
            backends.presence.clone(),
            config.presence.ttl,
        ));

        let relays = Relays {
            events: EventRelay::new(
                backends.event_log.clone(),
                hub.clone(),
                encryption,
                config.instance_id.clone(),
            ),
            pubsub: PubSubRelay::new(
                backends.presence.clone(),
                hub.clone(),
                config.instance_id.clone(),
            ),
            pubsub_requests: relay_rx,
        };

        let state = Self {
            config,
            hub,
            commands,
            queries,
            conversations,
            dispatcher,
            presence: backends.presence,
            verifier: backends.verifier,
        };
        (state, relays)
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            hub: self.hub.clone(),
            dispatcher: self.dispatcher.clone(),
            presence: self.presence.clone(),
            websocket: self.config.websocket.clone(),
            presence_config: self.config.presence.clone(),
            instance_id: self.config.instance_id.clone(),
        }
    }
}
