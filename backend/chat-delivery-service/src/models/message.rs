use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Audio,
    Video,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Audio => "audio",
            MessageKind::Video => "video",
            MessageKind::System => "system",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "audio" => Ok(MessageKind::Audio),
            "video" => Ok(MessageKind::Video),
            "system" => Ok(MessageKind::System),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// Stored message document. `content` is always the sealed ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub kind: MessageKind,
    pub reply_to: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub delivered: bool,
    #[serde(default)]
    pub read_by: BTreeSet<String>,
    #[serde(default)]
    pub deleted_for: BTreeSet<String>,
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<String>>,
}

impl Message {
    pub fn is_visible_to(&self, viewer: Option<&str>) -> bool {
        viewer.map_or(true, |v| !self.deleted_for.contains(v))
    }
}

/// A message about to be created; `content` is plaintext.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Decrypted projection returned to readers and pushed to sockets.
///
/// When decryption fails `content` is `None` and `content_unavailable` is set;
/// ciphertext never leaves the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub content_unavailable: bool,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub delivered: bool,
    pub read_by: Vec<String>,
    pub reactions: BTreeMap<String, Vec<String>>,
}

impl MessageView {
    pub fn from_message(message: &Message, plaintext: Option<String>) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            content_unavailable: plaintext.is_none(),
            content: plaintext,
            kind: message.kind,
            reply_to: message.reply_to.clone(),
            metadata: message.metadata.clone(),
            created_at: message.created_at,
            edited_at: message.edited_at,
            delivered: message.delivered,
            read_by: message.read_by.iter().cloned().collect(),
            reactions: message
                .reactions
                .iter()
                .map(|(emoji, users)| (emoji.clone(), users.iter().cloned().collect()))
                .collect(),
        }
    }
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
