use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one bridged channel.
///
/// `receiver_id` separates per-user views of the same remote channel (private
/// chats). It is empty for channels shared by every bridged user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub channel_id: String,
    #[serde(default)]
    pub receiver_id: String,
}

impl ChannelKey {
    pub fn new(channel_id: impl Into<String>, receiver_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            receiver_id: receiver_id.into(),
        }
    }

    /// Key for a channel that is the same for all bridged users.
    pub fn shared(channel_id: impl Into<String>) -> Self {
        Self::new(channel_id, "")
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.receiver_id.is_empty() {
            write!(f, "{}", self.channel_id)
        } else {
            write!(f, "{}/{}", self.channel_id, self.receiver_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Channel,
    Direct,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "channel" => Some(Self::Channel),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub url: String,
}

/// A message as the upstream service reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    pub channel_id: String,
    pub author: RemoteUser,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Remote message this one replies to.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Thread the message was posted in. `None` for top-level channel messages.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Thread that was started from this message, if any.
    #[serde(default)]
    pub started_thread: Option<String>,
}

/// A message sent by a local user, as received from the target protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMessage {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Local event this message replies to.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Local event the message names as its thread root.
    #[serde(default)]
    pub thread_root: Option<String>,
}
