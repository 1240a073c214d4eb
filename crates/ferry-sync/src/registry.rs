use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use ferry_types::events::{LocalEvent, RemoteEvent};
use ferry_types::models::{ChannelKey, ChannelKind};

use crate::context::SharedContext;
use crate::error::{BridgeError, Result};
use crate::portal::{Portal, PortalHandle};

/// Owns every running portal. At most one portal exists per channel key.
#[derive(Clone)]
pub struct PortalRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    ctx: SharedContext,

    /// Running portals: channel key -> inbox handle
    portals: RwLock<HashMap<ChannelKey, PortalHandle>>,
}

impl PortalRegistry {
    pub fn new(ctx: SharedContext) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                portals: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Running portal for `key`, loading or creating its record and starting
    /// its actor on first use.
    pub async fn get_or_create(&self, key: &ChannelKey, kind: ChannelKind) -> Result<PortalHandle> {
        if let Some(handle) = self.inner.portals.read().await.get(key) {
            return Ok(handle.clone());
        }

        let mut portals = self.inner.portals.write().await;
        if let Some(handle) = portals.get(key) {
            return Ok(handle.clone());
        }

        let ctx = &self.inner.ctx;
        let record = ctx.db.upsert_portal(key, kind).map_err(BridgeError::Store)?;
        let portal = Portal::new(Arc::clone(ctx), record);
        let handle = portal.spawn(ctx.config.inbox_capacity);
        portals.insert(key.clone(), handle.clone());

        info!(channel_id = %key, room_id = ?portal.room_id(), "Started portal");
        Ok(handle)
    }

    /// Running portal for `key`, if one has been started.
    pub async fn get(&self, key: &ChannelKey) -> Option<PortalHandle> {
        self.inner.portals.read().await.get(key).cloned()
    }

    /// Portal bridged into `room_id`, starting it if it is only in the store.
    pub async fn get_by_room(&self, room_id: &str) -> Result<Option<PortalHandle>> {
        let record = self
            .inner
            .ctx
            .db
            .get_portal_by_room(room_id)
            .map_err(BridgeError::Store)?;
        match record {
            Some(record) => Ok(Some(self.get_or_create(&record.channel, record.kind).await?)),
            None => Ok(None),
        }
    }

    /// Number of running portals.
    pub async fn len(&self) -> usize {
        self.inner.portals.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Deliver an upstream event to the portal of its channel. Events from a
    /// known thread go to the thread's parent portal.
    pub async fn route_remote(&self, mut event: RemoteEvent, receiver_id: &str, kind: ChannelKind) -> Result<()> {
        let channel_id = event.channel_id().to_string();
        let thread = self
            .inner
            .ctx
            .db
            .get_thread(&channel_id)
            .map_err(BridgeError::Store)?;

        let key = match thread {
            Some(thread) => {
                if let RemoteEvent::MessageCreate(msg) | RemoteEvent::MessageUpdate(msg) = &mut event {
                    msg.thread_id.get_or_insert_with(|| channel_id.clone());
                }
                ChannelKey::new(thread.parent_channel_id, receiver_id)
            }
            None => ChannelKey::new(channel_id, receiver_id),
        };

        let handle = self.get_or_create(&key, kind).await?;
        handle.queue_remote(event).await
    }

    /// Deliver a target-side event to the portal of `room_id`. Events for rooms
    /// the bridge does not own are dropped.
    pub async fn route_local(&self, room_id: &str, event: LocalEvent) -> Result<()> {
        match self.get_by_room(room_id).await? {
            Some(handle) => handle.queue_local(event).await,
            None => {
                debug!(room_id = %room_id, event_id = %event.event_id(), "Dropping event for unknown room");
                Ok(())
            }
        }
    }
}
