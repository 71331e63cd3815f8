pub mod conversation;
pub mod message;
pub mod presence;

pub use conversation::{Conversation, Membership};
pub use message::{Message, MessageKind, MessageView, NewMessage};
pub use presence::{ConnectionMeta, PresenceRecord, PresenceStatus};

pub use event_schema::DeleteScope;
