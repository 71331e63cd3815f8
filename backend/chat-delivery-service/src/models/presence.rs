use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

/// Per-connection entry kept under the owning user in the presence store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionMeta {
    pub connection_id: String,
    pub conversation_id: String,
    pub instance_id: String,
    pub connected_at: DateTime<Utc>,
}
