//! History backfill: the initial fill after room creation, and recovery of
//! messages missed while the bridge was offline.
//!
//! All backfill for a portal runs under its backfill lock. Pages are dispatched
//! oldest first, either as one pre-assigned batch when the target supports it
//! or message by message through the same path live messages take.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use ferry_db::models::MessageRecord;
use ferry_types::events::{HistoryQuery, Relation, TargetEvent};
use ferry_types::models::RemoteMessage;
use ferry_types::snowflake::{self, should_backfill, sort_oldest_first};

use crate::collab::Upstream;
use crate::error::{BridgeError, Result};
use crate::event_id::deterministic_event_id;
use crate::portal::Portal;
use crate::threads::ThreadContext;

/// Messages per upstream history request.
pub const BACKFILL_PAGE_SIZE: usize = 50;

/// Sent when bounded missed backfill could not reach the last bridged message.
pub const MISSED_GAP_NOTICE: &str =
    "Some messages may have been missed here while the bridge was offline.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Messages fetched from upstream.
    pub fetched: usize,
    /// Target events sent for them.
    pub dispatched: usize,
    /// Pages handed to the target.
    pub batches: usize,
    /// Whether the fetched range reaches back to the last bridged message or
    /// the start of history.
    pub found_all: bool,
    pub gap_notice: bool,
}

/// Result of walking history backwards.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    /// Newest first, as upstream returns them.
    pub messages: Vec<RemoteMessage>,
    pub found_all: bool,
}

/// Page backwards from the newest message until `limit` messages are collected,
/// `until` is reached or history runs out. Keeps the newest `limit` messages.
///
/// Messages at or before `until` are not included. `found_all` is true when
/// nothing between `until` (or the start of history) and the newest message
/// was left out.
pub async fn collect_messages(
    upstream: &dyn Upstream,
    channel_id: &str,
    limit: usize,
    until: Option<&str>,
) -> anyhow::Result<Collected> {
    let mut messages: Vec<RemoteMessage> = Vec::new();
    let mut before: Option<String> = None;
    let mut found_all = false;

    loop {
        debug!(channel_id = %channel_id, before = ?before, "Fetching chunk of messages to backfill");
        let page = upstream
            .list_messages(channel_id, &HistoryQuery::before(before.clone(), BACKFILL_PAGE_SIZE))
            .await?;
        let page_len = page.len();

        for msg in page {
            if until.is_some_and(|until| snowflake::compare(&msg.id, until) != Ordering::Greater) {
                found_all = true;
                break;
            }
            before = Some(msg.id.clone());
            messages.push(msg);
        }

        if found_all {
            break;
        }
        if page_len < BACKFILL_PAGE_SIZE {
            found_all = true;
            break;
        }
        if messages.len() >= limit {
            break;
        }
    }

    if messages.len() > limit {
        found_all = false;
        messages.truncate(limit);
    }
    Ok(Collected { messages, found_all })
}

/// Target events and the records they will become, for one page.
#[derive(Debug, Clone, Default)]
pub struct ConvertedBatch {
    pub events: Vec<TargetEvent>,
    pub records: Vec<MessageRecord>,
    /// Threads started by messages in the page, as `(thread_id, root_remote_id)`.
    pub started_threads: Vec<(String, String)>,
}

impl Portal {
    /// Fill a freshly created room with recent history. Runs with the backfill
    /// lock that room creation took.
    pub(crate) async fn initial_backfill(self: Arc<Self>, _guard: OwnedMutexGuard<()>) {
        let limit = self.ctx.config.initial_backfill.for_kind(self.kind());
        match self.run_initial(limit, None).await {
            Ok(report) if report.fetched > 0 => {
                info!(
                    channel_id = %self.key(),
                    fetched = report.fetched,
                    dispatched = report.dispatched,
                    "Initial backfill complete"
                )
            }
            Ok(_) => {}
            Err(e) => warn!(channel_id = %self.key(), "Initial backfill failed: {}", e),
        }
    }

    /// Fill a newly joined thread with its recent history.
    pub async fn initial_thread_backfill(&self, thread_id: &str) -> Result<BackfillReport> {
        let _backfill = self.backfill_lock.lock().await;
        let limit = self.ctx.config.initial_backfill.for_thread();
        self.run_initial(limit, Some(thread_id)).await
    }

    /// Initial backfill body. Callers hold the backfill lock.
    pub(crate) async fn run_initial(&self, limit: i32, thread_id: Option<&str>) -> Result<BackfillReport> {
        // Initial backfill has no unbounded mode.
        if limit <= 0 {
            return Ok(BackfillReport::default());
        }
        let channel_id = thread_id.unwrap_or(self.key().channel_id.as_str());

        let collected = collect_messages(self.ctx.upstream.as_ref(), channel_id, limit as usize, None)
            .await
            .map_err(BridgeError::Upstream)?;
        let mut messages = collected.messages;
        sort_oldest_first(&mut messages);
        debug!(channel_id = %channel_id, count = messages.len(), "Collected initial history");

        let mut report = BackfillReport {
            fetched: messages.len(),
            found_all: collected.found_all,
            ..Default::default()
        };
        self.send_backfill_batch(messages, thread_id, &mut report).await?;
        Ok(report)
    }

    /// Bridge channel messages newer than the last bridged one. `upstream_latest`
    /// is the newest message ID upstream reports for the channel.
    pub async fn backfill_missed(&self, upstream_latest: &str) -> Result<BackfillReport> {
        let limit = self.ctx.config.missed_backfill.for_kind(self.kind());
        let result = self.run_missed(limit, upstream_latest, None).await;
        if let Err(e) = &result {
            warn!(channel_id = %self.key(), "Missed backfill failed: {}", e);
        }
        result
    }

    /// Bridge thread messages newer than the last one bridged into the thread.
    pub async fn backfill_thread_missed(&self, thread_id: &str, upstream_latest: &str) -> Result<BackfillReport> {
        let limit = self.ctx.config.missed_backfill.for_thread();
        let result = self.run_missed(limit, upstream_latest, Some(thread_id)).await;
        if let Err(e) = &result {
            warn!(channel_id = %self.key(), thread_id = %thread_id, "Missed thread backfill failed: {}", e);
        }
        result
    }

    async fn run_missed(&self, limit: i32, upstream_latest: &str, thread_id: Option<&str>) -> Result<BackfillReport> {
        if limit == 0 || self.room_id().is_none() {
            return Ok(BackfillReport::default());
        }

        let _backfill = self.backfill_lock.lock().await;
        let db = &self.ctx.db;
        let last = match thread_id {
            Some(thread_id) => {
                self.ctx
                    .threads
                    .get_or_create(self.key(), thread_id, thread_id)
                    .map_err(BridgeError::Store)?;
                db.get_last_in_thread(self.key(), thread_id)
            }
            None => db.get_last(self.key()),
        }
        .map_err(BridgeError::Store)?;

        let Some(last) = last else {
            debug!(channel_id = %self.key(), "Nothing bridged yet, skipping missed backfill");
            return Ok(BackfillReport::default());
        };
        if !should_backfill(&last.remote_message_id, upstream_latest) {
            debug!(
                channel_id = %self.key(),
                last_known = %last.remote_message_id,
                latest = %upstream_latest,
                "No missed messages"
            );
            return Ok(BackfillReport::default());
        }

        info!(
            channel_id = %self.key(),
            thread_id = ?thread_id,
            last_known = %last.remote_message_id,
            latest = %upstream_latest,
            limit,
            "Backfilling missed messages"
        );
        if limit < 0 {
            self.backfill_unbounded(&last.remote_message_id, thread_id).await
        } else {
            self.backfill_bounded(limit as usize, &last.remote_message_id, thread_id)
                .await
        }
    }

    async fn backfill_bounded(&self, limit: usize, last_known: &str, thread_id: Option<&str>) -> Result<BackfillReport> {
        let channel_id = thread_id.unwrap_or(self.key().channel_id.as_str());
        let collected = collect_messages(self.ctx.upstream.as_ref(), channel_id, limit, Some(last_known))
            .await
            .map_err(BridgeError::Upstream)?;
        let mut messages = collected.messages;
        sort_oldest_first(&mut messages);

        let mut report = BackfillReport {
            fetched: messages.len(),
            found_all: collected.found_all,
            ..Default::default()
        };

        if !collected.found_all {
            let room = self.require_room()?;
            let mut notice = TargetEvent::notice(MISSED_GAP_NOTICE, Utc::now());
            if let Some(thread_id) = thread_id {
                notice.relates_to = self
                    .ctx
                    .threads
                    .get(self.key(), thread_id)
                    .map_err(BridgeError::Store)?
                    .and_then(|t| t.relation());
            }
            self.ctx
                .target
                .send_one(&room, &notice)
                .await
                .map_err(BridgeError::Dispatch)?;
            report.gap_notice = true;
        }

        self.send_backfill_batch(messages, thread_id, &mut report).await?;
        Ok(report)
    }

    /// Page forward from the last bridged message until upstream returns a
    /// short page, dispatching each page as it arrives.
    async fn backfill_unbounded(&self, last_known: &str, thread_id: Option<&str>) -> Result<BackfillReport> {
        let channel_id = thread_id.unwrap_or(self.key().channel_id.as_str());
        let mut after = last_known.to_string();
        let mut report = BackfillReport {
            found_all: true,
            ..Default::default()
        };

        loop {
            debug!(channel_id = %channel_id, after = %after, "Fetching chunk of messages to backfill");
            let mut page = self
                .ctx
                .upstream
                .list_messages(channel_id, &HistoryQuery::after(after.clone(), BACKFILL_PAGE_SIZE))
                .await
                .map_err(BridgeError::Upstream)?;
            let page_len = page.len();
            sort_oldest_first(&mut page);
            if let Some(newest) = page.last() {
                after = newest.id.clone();
            }

            report.fetched += page_len;
            self.send_backfill_batch(page, thread_id, &mut report).await?;

            if page_len < BACKFILL_PAGE_SIZE {
                break;
            }
        }

        Ok(report)
    }

    /// Dispatch one page, oldest first.
    async fn send_backfill_batch(
        &self,
        mut messages: Vec<RemoteMessage>,
        thread_id: Option<&str>,
        report: &mut BackfillReport,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        if let Some(thread_id) = thread_id {
            for msg in &mut messages {
                msg.thread_id = Some(thread_id.to_string());
            }
        }
        let room = self.require_room()?;

        if self.ctx.target.supports_batch() {
            debug!(channel_id = %self.key(), count = messages.len(), "Using batch send for backfill");
            self.forward_batch_send(&room, &messages, thread_id, report).await
        } else {
            debug!(channel_id = %self.key(), count = messages.len(), "Using one-by-one backfill");
            report.batches += 1;
            for msg in &messages {
                match self.bridge_message(msg).await {
                    Ok(sent) => report.dispatched += sent,
                    Err(e @ BridgeError::Conversion { .. }) => warn!(
                        channel_id = %self.key(),
                        remote_id = %msg.id,
                        "Skipping message in backfill: {}",
                        e
                    ),
                    // Nothing after a failed send may be recorded.
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
    }

    async fn forward_batch_send(
        &self,
        room: &str,
        messages: &[RemoteMessage],
        thread_id: Option<&str>,
        report: &mut BackfillReport,
    ) -> Result<()> {
        let thread = match thread_id {
            Some(thread_id) => Some(
                self.ctx
                    .threads
                    .get_or_create(self.key(), thread_id, thread_id)
                    .map_err(BridgeError::Store)?,
            ),
            None => None,
        };

        let batch = self.convert_batch(room, messages, thread.as_ref()).await?;
        if batch.events.is_empty() {
            debug!(channel_id = %self.key(), "No new events in backfill page");
            return Ok(());
        }
        info!(
            channel_id = %self.key(),
            messages = messages.len(),
            events = batch.events.len(),
            "Converted messages to backfill"
        );

        let ids = self
            .ctx
            .target
            .send_batch(room, &batch.events, true)
            .await
            .map_err(BridgeError::Dispatch)?;
        if ids.len() != batch.events.len() {
            return Err(BridgeError::BatchMismatch {
                expected: batch.events.len(),
                got: ids.len(),
            });
        }

        let mut records = batch.records;
        for (record, id) in records.iter_mut().zip(ids) {
            record.local_event_id = id;
        }
        self.ctx
            .db
            .bulk_insert_messages(&records)
            .map_err(BridgeError::Store)?;
        debug!(channel_id = %self.key(), count = records.len(), "Inserted backfilled batch");

        if let Some(thread_id) = thread_id {
            for record in &records {
                self.ctx
                    .threads
                    .advance(self.key(), thread_id, &record.local_event_id)
                    .map_err(BridgeError::Store)?;
            }
        }
        for (started, root) in &batch.started_threads {
            self.ctx
                .threads
                .get_or_create(self.key(), started, root)
                .map_err(BridgeError::Store)?;
        }

        report.dispatched += records.len();
        report.batches += 1;
        Ok(())
    }

    /// Convert a page into events with pre-assigned IDs.
    ///
    /// Already bridged messages are skipped and messages that fail to convert
    /// are dropped from the page. Replies to earlier messages in the same page
    /// and thread continuations point at the pre-assigned IDs.
    pub async fn convert_batch(
        &self,
        room: &str,
        messages: &[RemoteMessage],
        thread: Option<&ThreadContext>,
    ) -> Result<ConvertedBatch> {
        let db = &self.ctx.db;
        let server_name = &self.ctx.config.server_name;
        let thread_id = thread.map(|t| t.thread_id.clone()).unwrap_or_default();

        let mut root = thread.and_then(|t| t.root_local_id.clone());
        let mut last = thread.and_then(|t| t.last_known_local_id.clone());
        let mut in_batch: HashMap<String, String> = HashMap::new();
        let mut batch = ConvertedBatch::default();

        for msg in messages {
            if in_batch.contains_key(&msg.id)
                || !db
                    .get_by_remote_id(self.key(), &msg.id)
                    .map_err(BridgeError::Store)?
                    .is_empty()
            {
                debug!(channel_id = %self.key(), remote_id = %msg.id, "Skipping already bridged message");
                continue;
            }

            let sender = match self.ctx.converter.update_ghost(&msg.author).await {
                Ok(sender) => sender,
                Err(e) => {
                    warn!(remote_id = %msg.id, "Failed to update ghost, skipping message: {:#}", e);
                    continue;
                }
            };
            let reply_to = match &msg.reply_to {
                Some(reply_to) => match in_batch.get(reply_to) {
                    Some(id) => Some(id.clone()),
                    None => self.local_reply_target(msg)?,
                },
                None => None,
            };
            let parts = match self.ctx.converter.convert(msg, thread).await {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(remote_id = %msg.id, "Failed to convert message, skipping: {:#}", e);
                    continue;
                }
            };

            for part in parts {
                let id = deterministic_event_id(room, &msg.id, &part.part_name, server_name);
                let relates_to = match (&root, &reply_to) {
                    (Some(root), _) => Some(Relation::Thread {
                        root: root.clone(),
                        last: last.clone().unwrap_or_else(|| root.clone()),
                    }),
                    (None, Some(reply_to)) => Some(Relation::Reply {
                        event_id: reply_to.clone(),
                    }),
                    (None, None) => None,
                };

                batch.events.push(TargetEvent {
                    id: Some(id.clone()),
                    sender: sender.clone(),
                    timestamp: msg.timestamp,
                    content: part.content,
                    relates_to,
                });
                batch.records.push(MessageRecord {
                    channel: self.key().clone(),
                    remote_message_id: msg.id.clone(),
                    part_name: part.part_name,
                    thread_id: thread_id.clone(),
                    sender_remote_id: msg.author.id.clone(),
                    sender_local_id: sender.clone(),
                    timestamp: msg.timestamp,
                    local_event_id: id.clone(),
                });
                in_batch.entry(msg.id.clone()).or_insert_with(|| id.clone());

                if thread.is_some() {
                    if root.is_none() {
                        root = Some(id.clone());
                    }
                    last = Some(id);
                }
            }

            if let Some(started) = &msg.started_thread {
                batch.started_threads.push((started.clone(), msg.id.clone()));
            }
        }

        Ok(batch)
    }
}
