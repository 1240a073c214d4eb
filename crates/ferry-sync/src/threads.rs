use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use tracing::debug;

use ferry_db::Database;
use ferry_db::models::ThreadRecord;
use ferry_types::events::Relation;
use ferry_types::models::ChannelKey;

/// What a portal knows about one upstream thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadContext {
    pub thread_id: String,
    pub parent_channel_id: String,
    pub root_remote_message_id: String,
    /// Local event the thread hangs off. Unknown until the root is bridged or
    /// the first message in the thread is.
    pub root_local_id: Option<String>,
    /// Most recent local event in the thread.
    pub last_known_local_id: Option<String>,
    pub join_notice_local_id: Option<String>,
}

impl ThreadContext {
    /// Relation for the next event in this thread, continuing from the tail.
    pub fn relation(&self) -> Option<Relation> {
        let root = self.root_local_id.clone()?;
        let last = self.last_known_local_id.clone().unwrap_or_else(|| root.clone());
        Some(Relation::Thread { root, last })
    }
}

/// Caches thread state in front of the store. The tail only ever lives here;
/// after a restart it is rebuilt from the newest message recorded in the thread.
pub struct ThreadTracker {
    db: Arc<Database>,
    cache: Mutex<HashMap<String, ThreadContext>>,
}

impl ThreadTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ThreadContext>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Known thread, from cache or store. Never creates one.
    pub fn get(&self, key: &ChannelKey, thread_id: &str) -> Result<Option<ThreadContext>> {
        let mut cache = self.lock();
        if let Some(ctx) = cache.get_mut(thread_id) {
            self.resolve_root(key, ctx)?;
            return Ok(Some(ctx.clone()));
        }

        let Some(record) = self.db.get_thread(thread_id)? else {
            return Ok(None);
        };
        let ctx = self.load(key, record)?;
        cache.insert(thread_id.to_string(), ctx.clone());
        Ok(Some(ctx))
    }

    /// Known thread, or a new one rooted at `root_remote_message_id`.
    pub fn get_or_create(
        &self,
        key: &ChannelKey,
        thread_id: &str,
        root_remote_message_id: &str,
    ) -> Result<ThreadContext> {
        if let Some(ctx) = self.get(key, thread_id)? {
            return Ok(ctx);
        }

        let record = ThreadRecord {
            thread_remote_id: thread_id.to_string(),
            parent_channel_id: key.channel_id.clone(),
            root_remote_message_id: root_remote_message_id.to_string(),
            root_local_event_id: None,
            join_notice_local_event_id: None,
        };
        if self.db.insert_thread(&record)? {
            debug!(
                channel_id = %key,
                thread_id = %thread_id,
                root_id = %root_remote_message_id,
                "Registered thread"
            );
        }

        // Another writer may have won the insert; reload whatever is stored.
        let stored = self.db.get_thread(thread_id)?.unwrap_or(record);
        let ctx = self.load(key, stored)?;
        self.lock().insert(thread_id.to_string(), ctx.clone());
        Ok(ctx)
    }

    /// Thread whose root or join notice is `local_id`.
    pub fn find_by_local(&self, key: &ChannelKey, local_id: &str) -> Result<Option<ThreadContext>> {
        {
            let cache = self.lock();
            let hit = cache.values().find(|ctx| {
                ctx.parent_channel_id == key.channel_id
                    && (ctx.root_local_id.as_deref() == Some(local_id)
                        || ctx.join_notice_local_id.as_deref() == Some(local_id))
            });
            if let Some(ctx) = hit {
                return Ok(Some(ctx.clone()));
            }
        }

        match self.db.get_thread_by_local_event(&key.channel_id, local_id)? {
            Some(record) => self.get(key, &record.thread_remote_id),
            None => Ok(None),
        }
    }

    /// Record that `local_id` was just sent into the thread. If the thread had
    /// no root yet, this event becomes it.
    pub fn advance(&self, key: &ChannelKey, thread_id: &str, local_id: &str) -> Result<ThreadContext> {
        let ctx = self.get_or_create(key, thread_id, thread_id)?;

        let mut cache = self.lock();
        let entry = cache.entry(thread_id.to_string()).or_insert(ctx);
        if entry.root_local_id.is_none() {
            if self.db.set_thread_root_local(thread_id, local_id)? {
                entry.root_local_id = Some(local_id.to_string());
            } else {
                // Root was set elsewhere; the stored one stands.
                entry.root_local_id = self
                    .db
                    .get_thread(thread_id)?
                    .and_then(|record| record.root_local_event_id)
                    .or_else(|| Some(local_id.to_string()));
            }
        }
        entry.last_known_local_id = Some(local_id.to_string());
        Ok(entry.clone())
    }

    /// Returns false if the thread already had a join notice.
    pub fn set_join_notice(&self, key: &ChannelKey, thread_id: &str, local_id: &str) -> Result<bool> {
        let ctx = self.get_or_create(key, thread_id, thread_id)?;
        if ctx.join_notice_local_id.is_some() {
            return Ok(false);
        }

        let updated = self.db.set_thread_join_notice(thread_id, local_id)?;
        if updated {
            if let Some(entry) = self.lock().get_mut(thread_id) {
                entry.join_notice_local_id = Some(local_id.to_string());
            }
        }
        Ok(updated)
    }

    fn load(&self, key: &ChannelKey, record: ThreadRecord) -> Result<ThreadContext> {
        let last = self.db.get_last_in_thread(key, &record.thread_remote_id)?;
        let mut ctx = ThreadContext {
            thread_id: record.thread_remote_id,
            parent_channel_id: record.parent_channel_id,
            root_remote_message_id: record.root_remote_message_id,
            root_local_id: record.root_local_event_id,
            last_known_local_id: last.map(|m| m.local_event_id),
            join_notice_local_id: record.join_notice_local_event_id,
        };
        self.resolve_root(key, &mut ctx)?;
        if ctx.last_known_local_id.is_none() {
            ctx.last_known_local_id = ctx.root_local_id.clone();
        }
        Ok(ctx)
    }

    /// Fill in the root's local event once the root message has been bridged.
    fn resolve_root(&self, key: &ChannelKey, ctx: &mut ThreadContext) -> Result<()> {
        if ctx.root_local_id.is_some() {
            return Ok(());
        }
        let parts = self.db.get_by_remote_id(key, &ctx.root_remote_message_id)?;
        let Some(first) = parts.into_iter().next() else {
            return Ok(());
        };
        self.db.set_thread_root_local(&ctx.thread_id, &first.local_event_id)?;
        // Reload in case someone else set it first.
        ctx.root_local_id = match self.db.get_thread(&ctx.thread_id)? {
            Some(stored) => stored.root_local_event_id.or(Some(first.local_event_id)),
            None => Some(first.local_event_id),
        };
        if ctx.last_known_local_id.is_none() {
            ctx.last_known_local_id = ctx.root_local_id.clone();
        }
        Ok(())
    }
}
