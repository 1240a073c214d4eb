//! Seams to the outside world. The sync core owns none of these; it is handed
//! implementations through [`BridgeContext`](crate::context::BridgeContext).

use async_trait::async_trait;

use ferry_types::events::{ConvertedPart, HistoryQuery, OutboundMessage, TargetEvent};
use ferry_types::models::{ChannelKey, ChannelKind, LocalMessage, RemoteMessage, RemoteUser};

use crate::threads::ThreadContext;

/// The upstream chat service.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Remote user ID the bridge posts as.
    fn user_id(&self) -> String;

    /// One page of channel history, newest first.
    async fn list_messages(
        &self,
        channel_id: &str,
        query: &HistoryQuery,
    ) -> anyhow::Result<Vec<RemoteMessage>>;

    async fn send_message(
        &self,
        channel_id: &str,
        message: &OutboundMessage,
    ) -> anyhow::Result<RemoteMessage>;

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> anyhow::Result<()>;

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> anyhow::Result<()>;

    async fn remove_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> anyhow::Result<()>;

    /// Start a thread on a message and return the thread's channel ID.
    async fn start_thread(&self, channel_id: &str, root_message_id: &str) -> anyhow::Result<String>;
}

/// The target protocol rooms are bridged into.
#[async_trait]
pub trait Target: Send + Sync {
    async fn create_room(&self, key: &ChannelKey, kind: ChannelKind) -> anyhow::Result<String>;

    /// Send one event and return the ID the target assigned.
    async fn send_one(&self, room_id: &str, event: &TargetEvent) -> anyhow::Result<String>;

    fn supports_batch(&self) -> bool {
        false
    }

    /// Send events with pre-assigned IDs in one request. Returns the
    /// acknowledged IDs in input order.
    async fn send_batch(
        &self,
        room_id: &str,
        events: &[TargetEvent],
        forward: bool,
    ) -> anyhow::Result<Vec<String>> {
        let _ = (room_id, events, forward);
        anyhow::bail!("batch sending is not supported")
    }

    async fn redact(&self, room_id: &str, event_id: &str) -> anyhow::Result<()>;
}

/// Message and user conversion between the two sides.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Local user ID of the ghost puppeting a remote user.
    fn ghost_id(&self, remote_user_id: &str) -> String;

    /// Whether a local user is one the bridge controls. Events from these
    /// users are echoes and are never sent upstream.
    fn is_bridge_user(&self, local_user_id: &str) -> bool;

    /// Sync the ghost's profile and return its local user ID.
    async fn update_ghost(&self, user: &RemoteUser) -> anyhow::Result<String>;

    async fn convert(
        &self,
        message: &RemoteMessage,
        thread: Option<&ThreadContext>,
    ) -> anyhow::Result<Vec<ConvertedPart>>;

    async fn convert_local(&self, message: &LocalMessage) -> anyhow::Result<OutboundMessage>;
}
