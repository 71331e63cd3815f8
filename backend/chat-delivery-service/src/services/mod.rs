pub mod command_pipeline;
pub mod conversation_service;
pub mod encryption;
pub mod event_relay;
pub mod pubsub_relay;
pub mod query_pipeline;
pub mod recent_cache;

pub use command_pipeline::{CommandOutcome, CommandPipeline, RelayStatus};
pub use conversation_service::ConversationService;
pub use encryption::EncryptionService;
pub use event_relay::EventRelay;
pub use pubsub_relay::PubSubRelay;
pub use query_pipeline::QueryPipeline;
pub use recent_cache::{InMemoryRecentCache, RecentMessageCache, RedisRecentCache};

use crate::websocket::BroadcastReport;

/// What a relay did with one inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered(BroadcastReport),
    /// Originated on this instance and was already delivered locally.
    OwnOrigin,
    Malformed,
    Incompatible,
}
