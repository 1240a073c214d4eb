//! Database row types. These map directly to SQLite rows.
//! Timestamps are stored as unix milliseconds.

use chrono::{DateTime, Utc};
use ferry_types::models::{ChannelKey, ChannelKind};

/// One local event that resulted from a remote message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub channel: ChannelKey,
    pub remote_message_id: String,
    /// Empty for the primary text part, otherwise the attachment ID.
    pub part_name: String,
    /// Empty when the message is not in a thread.
    pub thread_id: String,
    pub sender_remote_id: String,
    pub sender_local_id: String,
    pub timestamp: DateTime<Utc>,
    pub local_event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub thread_remote_id: String,
    pub parent_channel_id: String,
    pub root_remote_message_id: String,
    pub root_local_event_id: Option<String>,
    pub join_notice_local_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRecord {
    pub channel: ChannelKey,
    pub remote_message_id: String,
    pub sender_remote_id: String,
    pub emoji: String,
    pub local_event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRecord {
    pub channel: ChannelKey,
    pub kind: ChannelKind,
    pub room_id: Option<String>,
}
