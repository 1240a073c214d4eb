use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use futures_util::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use ferry_db::models::{MessageRecord, PortalRecord};
use ferry_types::events::{LocalEvent, Relation, RemoteEvent, TargetEvent};
use ferry_types::models::{ChannelKey, ChannelKind, RemoteMessage};

use crate::context::SharedContext;
use crate::error::{BridgeError, Result};
use crate::threads::ThreadContext;

/// One bridged channel paired with its target room.
///
/// Events for the channel are handled one at a time by the portal's actor task.
/// Backfill runs outside the actor and is serialized against live message
/// creation by `backfill_lock`, which covers the channel and all its threads.
pub struct Portal {
    key: ChannelKey,
    kind: ChannelKind,
    room_id: RwLock<Option<String>>,
    room_create_lock: Mutex<()>,
    pub(crate) backfill_lock: Arc<Mutex<()>>,
    pub(crate) ctx: SharedContext,
}

/// Cloneable sender side of a portal's two inboxes.
#[derive(Clone)]
pub struct PortalHandle {
    portal: Arc<Portal>,
    remote_tx: mpsc::Sender<RemoteEvent>,
    local_tx: mpsc::Sender<LocalEvent>,
}

impl PortalHandle {
    pub fn portal(&self) -> &Arc<Portal> {
        &self.portal
    }

    /// Queue an upstream event. Waits while the inbox is full.
    pub async fn queue_remote(&self, event: RemoteEvent) -> Result<()> {
        self.remote_tx
            .send(event)
            .await
            .map_err(|_| BridgeError::PortalClosed(self.portal.key.to_string()))
    }

    /// Queue a target-side event. Waits while the inbox is full.
    pub async fn queue_local(&self, event: LocalEvent) -> Result<()> {
        self.local_tx
            .send(event)
            .await
            .map_err(|_| BridgeError::PortalClosed(self.portal.key.to_string()))
    }
}

impl Portal {
    pub fn new(ctx: SharedContext, record: PortalRecord) -> Arc<Self> {
        Arc::new(Self {
            key: record.channel,
            kind: record.kind,
            room_id: RwLock::new(record.room_id),
            room_create_lock: Mutex::new(()),
            backfill_lock: Arc::new(Mutex::new(())),
            ctx,
        })
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn room_id(&self) -> Option<String> {
        self.room_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn require_room(&self) -> Result<String> {
        self.room_id()
            .ok_or_else(|| BridgeError::NoRoom(self.key.to_string()))
    }

    /// Start the actor task and return the handle that feeds it.
    pub fn spawn(self: &Arc<Self>, capacity: usize) -> PortalHandle {
        let (remote_tx, remote_rx) = mpsc::channel(capacity);
        let (local_tx, local_rx) = mpsc::channel(capacity);
        tokio::spawn(Arc::clone(self).run(remote_rx, local_rx));
        PortalHandle {
            portal: Arc::clone(self),
            remote_tx,
            local_tx,
        }
    }

    async fn run(
        self: Arc<Self>,
        mut remote_rx: mpsc::Receiver<RemoteEvent>,
        mut local_rx: mpsc::Receiver<LocalEvent>,
    ) {
        debug!(channel_id = %self.key, "Portal actor started");

        // Neither inbox gets priority; select! picks among ready branches at random.
        loop {
            tokio::select! {
                Some(event) = remote_rx.recv() => self.process_remote(event).await,
                Some(event) = local_rx.recv() => self.process_local(event).await,
                else => break,
            }
        }

        debug!(channel_id = %self.key, "Portal actor stopped");
    }

    async fn process_remote(self: &Arc<Self>, event: RemoteEvent) {
        let kind = event.kind();
        match AssertUnwindSafe(self.handle_remote(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(channel_id = %self.key, event = kind, "Failed to handle remote event: {}", e)
            }
            Err(_) => {
                error!(channel_id = %self.key, event = kind, "Panic while handling remote event")
            }
        }
    }

    async fn process_local(self: &Arc<Self>, event: LocalEvent) {
        let kind = event.kind();
        let event_id = event.event_id().to_string();
        match AssertUnwindSafe(self.handle_local(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                channel_id = %self.key,
                event = kind,
                event_id = %event_id,
                "Failed to handle local event: {}",
                e
            ),
            Err(_) => error!(
                channel_id = %self.key,
                event = kind,
                event_id = %event_id,
                "Panic while handling local event"
            ),
        }
    }

    /// Return the portal's room, creating it first if needed.
    ///
    /// Creation holds the backfill lock and hands it to the initial backfill
    /// task, so live messages wait until history has been bridged.
    pub async fn ensure_room(self: &Arc<Self>) -> Result<String> {
        if let Some(room) = self.room_id() {
            return Ok(room);
        }

        let _create = self.room_create_lock.lock().await;
        if let Some(room) = self.room_id() {
            return Ok(room);
        }

        let backfill_guard = Arc::clone(&self.backfill_lock).lock_owned().await;
        let room = self
            .ctx
            .target
            .create_room(&self.key, self.kind)
            .await
            .map_err(|reason| BridgeError::RoomCreation {
                channel: self.key.to_string(),
                reason,
            })?;
        self.ctx
            .db
            .set_portal_room(&self.key, &room)
            .map_err(BridgeError::Store)?;
        *self
            .room_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(room.clone());

        info!(channel_id = %self.key, room_id = %room, "Created room for portal");

        let portal = Arc::clone(self);
        tokio::spawn(async move {
            portal.initial_backfill(backfill_guard).await;
        });

        Ok(room)
    }

    /// Bridge one remote message through the one-at-a-time path.
    ///
    /// Callers hold the backfill lock. Returns the number of events sent, which
    /// is zero when the message was already bridged.
    pub(crate) async fn bridge_message(&self, msg: &RemoteMessage) -> Result<usize> {
        let room = self.require_room()?;
        let db = &self.ctx.db;

        let existing = db
            .get_by_remote_id(&self.key, &msg.id)
            .map_err(BridgeError::Store)?;
        if !existing.is_empty() {
            debug!(channel_id = %self.key, remote_id = %msg.id, "Dropping duplicate message");
            return Ok(0);
        }

        let mut thread = match &msg.thread_id {
            Some(thread_id) => Some(
                self.ctx
                    .threads
                    .get_or_create(&self.key, thread_id, thread_id)
                    .map_err(BridgeError::Store)?,
            ),
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
        let reply_to = self.local_reply_target(msg)?;
        let parts = self
            .ctx
            .converter
            .convert(msg, thread.as_ref())
            .await
            .map_err(|reason| BridgeError::Conversion {
                message_id: msg.id.clone(),
                reason,
            })?;

        // Parts are recorded only once every part has been sent.
        let thread_id = msg.thread_id.clone().unwrap_or_default();
        let mut records = Vec::with_capacity(parts.len());
        for part in parts {
            let event = TargetEvent {
                id: None,
                sender: sender.clone(),
                timestamp: msg.timestamp,
                content: part.content,
                relates_to: relation_for(thread.as_ref(), reply_to.as_deref()),
            };
            let local_id = self
                .ctx
                .target
                .send_one(&room, &event)
                .await
                .map_err(BridgeError::Dispatch)?;

            records.push(MessageRecord {
                channel: self.key.clone(),
                remote_message_id: msg.id.clone(),
                part_name: part.part_name,
                thread_id: thread_id.clone(),
                sender_remote_id: msg.author.id.clone(),
                sender_local_id: sender.clone(),
                timestamp: msg.timestamp,
                local_event_id: local_id.clone(),
            });

            if !thread_id.is_empty() {
                thread = Some(
                    self.ctx
                        .threads
                        .advance(&self.key, &thread_id, &local_id)
                        .map_err(BridgeError::Store)?,
                );
            }
        }
        db.bulk_insert_messages(&records).map_err(BridgeError::Store)?;

        if let Some(started) = &msg.started_thread {
            self.ctx
                .threads
                .get_or_create(&self.key, started, &msg.id)
                .map_err(BridgeError::Store)?;
        }

        debug!(channel_id = %self.key, remote_id = %msg.id, events = records.len(), "Bridged message");
        Ok(records.len())
    }

    /// Local event of the first part of the message being replied to.
    pub(crate) fn local_reply_target(&self, msg: &RemoteMessage) -> Result<Option<String>> {
        let Some(reply_to) = &msg.reply_to else {
            return Ok(None);
        };
        let parts = self
            .ctx
            .db
            .get_by_remote_id(&self.key, reply_to)
            .map_err(BridgeError::Store)?;
        Ok(parts.into_iter().next().map(|p| p.local_event_id))
    }
}

/// Thread membership wins over a plain reply.
pub(crate) fn relation_for(thread: Option<&ThreadContext>, reply_to: Option<&str>) -> Option<Relation> {
    thread.and_then(ThreadContext::relation).or_else(|| {
        reply_to.map(|event_id| Relation::Reply {
            event_id: event_id.to_string(),
        })
    })
}
