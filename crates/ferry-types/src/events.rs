use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{LocalMessage, RemoteMessage};

/// Events arriving from the upstream service for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RemoteEvent {
    /// A message was posted
    MessageCreate(RemoteMessage),

    /// A message was edited; carries the full new version
    MessageUpdate(RemoteMessage),

    /// A message was deleted
    MessageDelete {
        channel_id: String,
        message_id: String,
    },

    /// A reaction was added to a message
    ReactionAdd {
        channel_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },

    /// A reaction was removed from a message
    ReactionRemove {
        channel_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },

    /// A thread was started in the channel
    ThreadCreate {
        channel_id: String,
        thread_id: String,
        root_message_id: String,
        name: String,
    },
}

impl RemoteEvent {
    /// Upstream channel the event belongs to. For thread messages this is the
    /// thread's own channel, not the parent.
    pub fn channel_id(&self) -> &str {
        match self {
            Self::MessageCreate(msg) | Self::MessageUpdate(msg) => &msg.channel_id,
            Self::MessageDelete { channel_id, .. }
            | Self::ReactionAdd { channel_id, .. }
            | Self::ReactionRemove { channel_id, .. }
            | Self::ThreadCreate { channel_id, .. } => channel_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageCreate(_) => "message_create",
            Self::MessageUpdate(_) => "message_update",
            Self::MessageDelete { .. } => "message_delete",
            Self::ReactionAdd { .. } => "reaction_add",
            Self::ReactionRemove { .. } => "reaction_remove",
            Self::ThreadCreate { .. } => "thread_create",
        }
    }
}

/// Events arriving from the target protocol for one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LocalEvent {
    Message(LocalMessage),

    Redaction {
        event_id: String,
        sender: String,
        redacts: String,
    },

    Reaction {
        event_id: String,
        sender: String,
        target_event_id: String,
        key: String,
    },
}

impl LocalEvent {
    pub fn event_id(&self) -> &str {
        match self {
            Self::Message(msg) => &msg.event_id,
            Self::Redaction { event_id, .. } | Self::Reaction { event_id, .. } => event_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Redaction { .. } => "redaction",
            Self::Reaction { .. } => "reaction",
        }
    }
}

/// How a target event relates to an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rel_type", rename_all = "snake_case")]
pub enum Relation {
    Reply { event_id: String },
    /// Thread membership. `last` is the event this one continues, which is the
    /// thread's current tail rather than always the root.
    Thread { root: String, last: String },
    Replace { event_id: String },
    Annotation { event_id: String, key: String },
}

/// One event the bridge sends into a target room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEvent {
    /// Pre-assigned identifier. Only set for batch sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Local user sending the event. Empty means the bridge itself.
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
}

impl TargetEvent {
    /// A plain notice from the bridge itself.
    pub fn notice(body: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            sender: String::new(),
            timestamp,
            content: serde_json::json!({ "msgtype": "m.notice", "body": body }),
            relates_to: None,
        }
    }
}

/// One piece of a converted remote message. The primary text part has an empty
/// `part_name`; attachments carry their attachment ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedPart {
    pub part_name: String,
    pub content: serde_json::Value,
}

/// Message content ready to post upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    /// Remote message being replied to.
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// Paging parameters for the upstream history API. Results are newest-first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub before: Option<String>,
    pub after: Option<String>,
    pub limit: usize,
}

impl HistoryQuery {
    pub fn before(cursor: Option<String>, limit: usize) -> Self {
        Self {
            before: cursor,
            after: None,
            limit,
        }
    }

    pub fn after(cursor: impl Into<String>, limit: usize) -> Self {
        Self {
            before: None,
            after: Some(cursor.into()),
            limit,
        }
    }
}
