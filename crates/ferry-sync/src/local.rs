//! Handlers for events arriving from the target side.

use std::sync::Arc;

use tracing::debug;

use ferry_db::models::{MessageRecord, ReactionRecord};
use ferry_types::events::LocalEvent;
use ferry_types::models::LocalMessage;

use crate::error::{BridgeError, Result};
use crate::portal::Portal;
use crate::threads::ThreadContext;

impl Portal {
    pub(crate) async fn handle_local(self: &Arc<Self>, event: LocalEvent) -> Result<()> {
        let sender = match &event {
            LocalEvent::Message(msg) => msg.sender.as_str(),
            LocalEvent::Redaction { sender, .. } | LocalEvent::Reaction { sender, .. } => sender,
        };
        if self.ctx.converter.is_bridge_user(sender) {
            debug!(channel_id = %self.key(), event_id = %event.event_id(), "Ignoring event from bridge user");
            return Ok(());
        }

        match event {
            LocalEvent::Message(msg) => self.handle_local_message(msg).await,
            LocalEvent::Redaction { redacts, .. } => self.handle_local_redaction(&redacts).await,
            LocalEvent::Reaction {
                event_id,
                target_event_id,
                key,
                ..
            } => self.handle_local_reaction(&event_id, &target_event_id, &key).await,
        }
    }

    async fn handle_local_message(&self, msg: LocalMessage) -> Result<()> {
        let db = &self.ctx.db;

        if db
            .get_by_local_id(self.key(), &msg.event_id)
            .map_err(BridgeError::Store)?
            .is_some()
        {
            debug!(channel_id = %self.key(), event_id = %msg.event_id, "Dropping already bridged event");
            return Ok(());
        }

        let thread = match &msg.thread_root {
            Some(root) => self.resolve_local_thread(root).await?,
            None => None,
        };

        let mut outbound = self
            .ctx
            .converter
            .convert_local(&msg)
            .await
            .map_err(|reason| BridgeError::Conversion {
                message_id: msg.event_id.clone(),
                reason,
            })?;
        if outbound.reply_to.is_none() {
            if let Some(reply_to) = &msg.reply_to {
                outbound.reply_to = db
                    .get_by_local_id(self.key(), reply_to)
                    .map_err(BridgeError::Store)?
                    .map(|r| r.remote_message_id);
            }
        }

        let channel_id = thread
            .as_ref()
            .map_or(self.key().channel_id.as_str(), |t| t.thread_id.as_str());
        let sent = self
            .ctx
            .upstream
            .send_message(channel_id, &outbound)
            .await
            .map_err(BridgeError::Upstream)?;

        let thread_id = thread.as_ref().map(|t| t.thread_id.clone()).unwrap_or_default();
        db.insert_message(&MessageRecord {
            channel: self.key().clone(),
            remote_message_id: sent.id.clone(),
            part_name: String::new(),
            thread_id: thread_id.clone(),
            sender_remote_id: sent.author.id.clone(),
            sender_local_id: msg.sender.clone(),
            timestamp: sent.timestamp,
            local_event_id: msg.event_id.clone(),
        })
        .map_err(BridgeError::Store)?;

        if !thread_id.is_empty() {
            self.ctx
                .threads
                .advance(self.key(), &thread_id, &msg.event_id)
                .map_err(BridgeError::Store)?;
        }

        debug!(
            channel_id = %self.key(),
            event_id = %msg.event_id,
            remote_id = %sent.id,
            "Sent local message upstream"
        );
        Ok(())
    }

    /// Upstream thread for a local thread root, starting one if the root has
    /// none yet. `None` when the root was never bridged, in which case the
    /// message goes to the channel itself.
    async fn resolve_local_thread(&self, root_local_id: &str) -> Result<Option<ThreadContext>> {
        let threads = &self.ctx.threads;
        if let Some(ctx) = threads
            .find_by_local(self.key(), root_local_id)
            .map_err(BridgeError::Store)?
        {
            return Ok(Some(ctx));
        }

        let Some(root) = self
            .ctx
            .db
            .get_by_local_id(self.key(), root_local_id)
            .map_err(BridgeError::Store)?
        else {
            debug!(channel_id = %self.key(), root = %root_local_id, "Thread root is not bridged");
            return Ok(None);
        };
        if !root.thread_id.is_empty() {
            // Replying inside an existing thread to one of its messages.
            return threads
                .get(self.key(), &root.thread_id)
                .map_err(BridgeError::Store);
        }

        let thread_id = self
            .ctx
            .upstream
            .start_thread(&self.key().channel_id, &root.remote_message_id)
            .await
            .map_err(BridgeError::Upstream)?;
        let ctx = threads
            .get_or_create(self.key(), &thread_id, &root.remote_message_id)
            .map_err(BridgeError::Store)?;
        Ok(Some(ctx))
    }

    async fn handle_local_redaction(&self, redacts: &str) -> Result<()> {
        let db = &self.ctx.db;

        if let Some(reaction) = db
            .get_reaction_by_local_id(self.key(), redacts)
            .map_err(BridgeError::Store)?
        {
            let channel_id = self.upstream_channel_for(&reaction.remote_message_id)?;
            self.ctx
                .upstream
                .remove_reaction(&channel_id, &reaction.remote_message_id, &reaction.emoji)
                .await
                .map_err(BridgeError::Upstream)?;
            db.delete_reaction(&reaction).map_err(BridgeError::Store)?;
            return Ok(());
        }

        if let Some(part) = db
            .get_by_local_id(self.key(), redacts)
            .map_err(BridgeError::Store)?
        {
            let channel_id = self.upstream_channel_for(&part.remote_message_id)?;
            self.ctx
                .upstream
                .delete_message(&channel_id, &part.remote_message_id)
                .await
                .map_err(BridgeError::Upstream)?;
            db.delete_all_messages(self.key(), &part.remote_message_id)
                .map_err(BridgeError::Store)?;
            return Ok(());
        }

        debug!(channel_id = %self.key(), redacts = %redacts, "Ignoring redaction of unknown event");
        Ok(())
    }

    async fn handle_local_reaction(&self, event_id: &str, target_event_id: &str, emoji: &str) -> Result<()> {
        let db = &self.ctx.db;

        if db
            .get_reaction_by_local_id(self.key(), event_id)
            .map_err(BridgeError::Store)?
            .is_some()
        {
            return Ok(());
        }
        let Some(target) = db
            .get_by_local_id(self.key(), target_event_id)
            .map_err(BridgeError::Store)?
        else {
            debug!(channel_id = %self.key(), target = %target_event_id, "Ignoring reaction to unknown event");
            return Ok(());
        };

        let bridge_user = self.ctx.upstream.user_id();
        if db
            .get_reaction(self.key(), &target.remote_message_id, &bridge_user, emoji)
            .map_err(BridgeError::Store)?
            .is_some()
        {
            debug!(channel_id = %self.key(), target = %target_event_id, "Dropping duplicate reaction");
            return Ok(());
        }

        let channel_id = if target.thread_id.is_empty() {
            self.key().channel_id.clone()
        } else {
            target.thread_id.clone()
        };
        self.ctx
            .upstream
            .add_reaction(&channel_id, &target.remote_message_id, emoji)
            .await
            .map_err(BridgeError::Upstream)?;

        db.insert_reaction(&ReactionRecord {
            channel: self.key().clone(),
            remote_message_id: target.remote_message_id,
            sender_remote_id: bridge_user,
            emoji: emoji.to_string(),
            local_event_id: event_id.to_string(),
        })
        .map_err(BridgeError::Store)?;
        Ok(())
    }

    /// Upstream channel a bridged message lives in: its thread, or the portal's channel.
    fn upstream_channel_for(&self, remote_message_id: &str) -> Result<String> {
        let parts = self
            .ctx
            .db
            .get_by_remote_id(self.key(), remote_message_id)
            .map_err(BridgeError::Store)?;
        Ok(match parts.into_iter().next() {
            Some(part) if !part.thread_id.is_empty() => part.thread_id,
            _ => self.key().channel_id.clone(),
        })
    }
}
