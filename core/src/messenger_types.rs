/// Shared types for the messenger layer
use crate::identity::UserKey;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Message payload, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum MessageKind {
    Text(String),
    /// Resource URL handed out by the media collaborator
    Photo(String),
    /// Resource URL handed out by the media collaborator
    Video(String),
    /// Anything an older client can't render; carries the raw content
    Unsupported(String),
}

impl MessageKind {
    pub fn content(&self) -> &str {
        match self {
            MessageKind::Text(s)
            | MessageKind::Photo(s)
            | MessageKind::Video(s)
            | MessageKind::Unsupported(s) => s,
        }
    }

    /// Inbox preview line
    pub fn preview(&self) -> String {
        match self {
            MessageKind::Text(text) => text.clone(),
            MessageKind::Photo(_) => "Photo".to_string(),
            MessageKind::Video(_) => "Video".to_string(),
            MessageKind::Unsupported(_) => "Unsupported message".to_string(),
        }
    }
}

/// One entry of a conversation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique within the conversation; doubles as the idempotency key
    pub id: String,
    pub kind: MessageKind,
    /// RFC3339, UTC
    pub timestamp: DateTime<Utc>,
    pub sender_key: UserKey,
    pub sender_display_name: String,
    pub is_read: bool,
}

impl Message {
    /// Same logical message, ignoring read state and send time.
    pub fn same_payload(&self, other: &Message) -> bool {
        self.id == other.id && self.sender_key == other.sender_key && self.kind == other.kind
    }
}

/// What a sender hands to the engine; the engine fills in identity fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    pub id: String,
    pub kind: MessageKind,
    pub sender_display_name: String,
    pub sent_at: DateTime<Utc>,
}

impl MessageDraft {
    /// Draft stamped now with a fresh id
    pub fn new(kind: MessageKind, sender_display_name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            sender_display_name: sender_display_name.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn text(text: impl Into<String>, sender_display_name: impl Into<String>) -> Self {
        Self::new(MessageKind::Text(text.into()), sender_display_name)
    }

    pub fn into_message(self, sender_key: UserKey) -> Message {
        Message {
            id: self.id,
            kind: self.kind,
            timestamp: self.sent_at,
            sender_key,
            sender_display_name: self.sender_display_name,
            is_read: false,
        }
    }
}

/// Headline of the newest message, duplicated into both summaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestMessage {
    pub timestamp: DateTime<Utc>,
    pub preview_text: String,
    pub is_read: bool,
}

impl From<&Message> for LatestMessage {
    fn from(message: &Message) -> Self {
        Self {
            timestamp: message.timestamp,
            preview_text: message.kind.preview(),
            is_read: message.is_read,
        }
    }
}

/// Summary of one conversation (for the inbox list)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    /// The other participant, from this copy's owner's point of view
    pub counterpart_key: UserKey,
    pub display_name: String,
    pub latest_message: LatestMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub display_name: String,
    pub user_key: UserKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Presentation-side formatting; never parsed back.
pub fn display_timestamp(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local)
        .format("%b %-d, %Y at %-I:%M:%S %p")
        .to_string()
}
