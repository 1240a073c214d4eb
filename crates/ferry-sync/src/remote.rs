//! Handlers for events arriving from upstream.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use ferry_db::models::ReactionRecord;
use ferry_types::events::{Relation, RemoteEvent, TargetEvent};
use ferry_types::models::RemoteMessage;

use crate::error::{BridgeError, Result};
use crate::portal::Portal;

impl Portal {
    pub(crate) async fn handle_remote(self: &Arc<Self>, event: RemoteEvent) -> Result<()> {
        match event {
            RemoteEvent::MessageCreate(msg) => self.handle_remote_create(msg).await,
            RemoteEvent::MessageUpdate(msg) => self.handle_remote_update(msg).await,
            RemoteEvent::MessageDelete { message_id, .. } => {
                self.handle_remote_delete(&message_id).await
            }
            RemoteEvent::ReactionAdd {
                message_id,
                user_id,
                emoji,
                ..
            } => self.handle_remote_reaction_add(&message_id, &user_id, &emoji).await,
            RemoteEvent::ReactionRemove {
                message_id,
                user_id,
                emoji,
                ..
            } => self.handle_remote_reaction_remove(&message_id, &user_id, &emoji).await,
            RemoteEvent::ThreadCreate {
                thread_id,
                root_message_id,
                name,
                ..
            } => self.handle_thread_create(&thread_id, &root_message_id, &name).await,
        }
    }

    async fn handle_remote_create(self: &Arc<Self>, msg: RemoteMessage) -> Result<()> {
        self.ensure_room().await?;

        // Waits for any backfill in progress, including the initial one.
        let _backfill = self.backfill_lock.lock().await;
        self.bridge_message(&msg).await?;
        Ok(())
    }

    async fn handle_remote_update(&self, msg: RemoteMessage) -> Result<()> {
        let Some(room) = self.room_id() else {
            debug!(channel_id = %self.key(), remote_id = %msg.id, "Dropping edit, portal has no room");
            return Ok(());
        };
        let db = &self.ctx.db;

        let existing = db
            .get_by_remote_id(self.key(), &msg.id)
            .map_err(BridgeError::Store)?;
        if existing.is_empty() {
            debug!(channel_id = %self.key(), remote_id = %msg.id, "Dropping edit of unknown message");
            return Ok(());
        }

        let thread = match &msg.thread_id {
            Some(thread_id) => self
                .ctx
                .threads
                .get(self.key(), thread_id)
                .map_err(BridgeError::Store)?,
            None => None,
        };
        let sender = self
            .ctx
            .converter
            .update_ghost(&msg.author)
            .await
            .map_err(|reason| BridgeError::Conversion {
                message_id: msg.id.clone(),
                reason,
            })?;
        let parts = self
            .ctx
            .converter
            .convert(&msg, thread.as_ref())
            .await
            .map_err(|reason| BridgeError::Conversion {
                message_id: msg.id.clone(),
                reason,
            })?;

        for part in parts {
            // Parts cannot be added by an edit, only replaced.
            let Some(original) = existing.iter().find(|r| r.part_name == part.part_name) else {
                continue;
            };
            let event = TargetEvent {
                id: None,
                sender: sender.clone(),
                timestamp: Utc::now(),
                content: part.content,
                relates_to: Some(Relation::Replace {
                    event_id: original.local_event_id.clone(),
                }),
            };
            self.ctx
                .target
                .send_one(&room, &event)
                .await
                .map_err(BridgeError::Dispatch)?;
        }
        Ok(())
    }

    async fn handle_remote_delete(&self, message_id: &str) -> Result<()> {
        let Some(room) = self.room_id() else {
            return Ok(());
        };
        let db = &self.ctx.db;

        let parts = db
            .get_by_remote_id(self.key(), message_id)
            .map_err(BridgeError::Store)?;
        if parts.is_empty() {
            debug!(channel_id = %self.key(), remote_id = %message_id, "Dropping delete of unknown message");
            return Ok(());
        }

        for part in &parts {
            if let Err(e) = self.ctx.target.redact(&room, &part.local_event_id).await {
                warn!(
                    channel_id = %self.key(),
                    event_id = %part.local_event_id,
                    "Failed to redact message part: {:#}",
                    e
                );
            }
        }
        db.delete_all_messages(self.key(), message_id)
            .map_err(BridgeError::Store)?;
        Ok(())
    }

    async fn handle_remote_reaction_add(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<()> {
        let Some(room) = self.room_id() else {
            return Ok(());
        };
        let db = &self.ctx.db;

        let Some(target) = db
            .get_by_remote_id(self.key(), message_id)
            .map_err(BridgeError::Store)?
            .into_iter()
            .next()
        else {
            debug!(channel_id = %self.key(), remote_id = %message_id, "Dropping reaction to unknown message");
            return Ok(());
        };

        let existing = db
            .get_reaction(self.key(), message_id, user_id, emoji)
            .map_err(BridgeError::Store)?;
        if existing.is_some() {
            debug!(channel_id = %self.key(), remote_id = %message_id, "Dropping duplicate reaction");
            return Ok(());
        }

        let event = TargetEvent {
            id: None,
            sender: self.ctx.converter.ghost_id(user_id),
            timestamp: Utc::now(),
            content: serde_json::json!({}),
            relates_to: Some(Relation::Annotation {
                event_id: target.local_event_id,
                key: emoji.to_string(),
            }),
        };
        let local_id = self
            .ctx
            .target
            .send_one(&room, &event)
            .await
            .map_err(BridgeError::Dispatch)?;

        db.insert_reaction(&ReactionRecord {
            channel: self.key().clone(),
            remote_message_id: message_id.to_string(),
            sender_remote_id: user_id.to_string(),
            emoji: emoji.to_string(),
            local_event_id: local_id,
        })
        .map_err(BridgeError::Store)?;
        Ok(())
    }

    async fn handle_remote_reaction_remove(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<()> {
        let Some(room) = self.room_id() else {
            return Ok(());
        };
        let db = &self.ctx.db;

        let Some(reaction) = db
            .get_reaction(self.key(), message_id, user_id, emoji)
            .map_err(BridgeError::Store)?
        else {
            return Ok(());
        };

        self.ctx
            .target
            .redact(&room, &reaction.local_event_id)
            .await
            .map_err(BridgeError::Dispatch)?;
        db.delete_reaction(&reaction).map_err(BridgeError::Store)?;
        Ok(())
    }

    async fn handle_thread_create(&self, thread_id: &str, root_message_id: &str, name: &str) -> Result<()> {
        let Some(room) = self.room_id() else {
            debug!(channel_id = %self.key(), thread_id = %thread_id, "Ignoring thread, portal has no room");
            return Ok(());
        };

        let _backfill = self.backfill_lock.lock().await;
        let thread = self
            .ctx
            .threads
            .get_or_create(self.key(), thread_id, root_message_id)
            .map_err(BridgeError::Store)?;
        if thread.join_notice_local_id.is_some() {
            return Ok(());
        }

        let mut notice = TargetEvent::notice(&format!("Thread started: {name}"), Utc::now());
        notice.relates_to = thread.relation();
        let notice_id = self
            .ctx
            .target
            .send_one(&room, &notice)
            .await
            .map_err(BridgeError::Dispatch)?;
        self.ctx
            .threads
            .set_join_notice(self.key(), thread_id, &notice_id)
            .map_err(BridgeError::Store)?;
        info!(channel_id = %self.key(), thread_id = %thread_id, "Joined new thread");

        let limit = self.ctx.config.initial_backfill.for_thread();
        self.run_initial(limit, Some(thread_id)).await?;
        Ok(())
    }
}
