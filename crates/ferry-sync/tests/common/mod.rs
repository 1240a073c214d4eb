#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use ferry_db::Database;
use ferry_db::models::MessageRecord;
use ferry_sync::collab::{Converter, Target, Upstream};
use ferry_sync::config::BridgeConfig;
use ferry_sync::threads::ThreadContext;
use ferry_sync::{BridgeContext, PortalRegistry, SharedContext};
use ferry_types::events::{ConvertedPart, HistoryQuery, OutboundMessage, TargetEvent};
use ferry_types::models::{
    Attachment, ChannelKey, ChannelKind, LocalMessage, RemoteMessage, RemoteUser,
};
use ferry_types::snowflake;

pub const ROOM: &str = "!room:test";
pub const BRIDGE_USER: &str = "bridge-bot";

pub fn ts(id: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap()
}

pub fn msg(id: u64, channel_id: &str) -> RemoteMessage {
    RemoteMessage {
        id: id.to_string(),
        channel_id: channel_id.into(),
        author: RemoteUser {
            id: "u1".into(),
            username: "alice".into(),
        },
        content: format!("message {id}"),
        timestamp: ts(id),
        attachments: Vec::new(),
        reply_to: None,
        thread_id: None,
        started_thread: None,
    }
}

pub fn with_attachments(mut message: RemoteMessage, names: &[&str]) -> RemoteMessage {
    message.attachments = names
        .iter()
        .map(|name| Attachment {
            id: format!("att-{name}"),
            filename: name.to_string(),
            url: format!("https://cdn.test/{name}"),
        })
        .collect();
    message
}

pub fn local_message(event_id: &str, sender: &str, body: &str) -> LocalMessage {
    LocalMessage {
        event_id: event_id.into(),
        room_id: ROOM.into(),
        sender: sender.into(),
        content: serde_json::json!({ "msgtype": "m.text", "body": body }),
        timestamp: Utc::now(),
        reply_to: None,
        thread_root: None,
    }
}

pub fn body(event: &TargetEvent) -> String {
    event.content["body"].as_str().unwrap_or_default().to_string()
}

/// Upstream with in-memory history. IDs are numeric and pages are newest first.
#[derive(Default)]
pub struct FakeUpstream {
    pub history: Mutex<HashMap<String, Vec<RemoteMessage>>>,
    pub list_calls: AtomicUsize,
    pub sent: Mutex<Vec<(String, OutboundMessage)>>,
    pub deleted: Mutex<Vec<(String, String)>>,
    pub reactions: Mutex<Vec<(String, String, String, bool)>>,
    pub started_threads: Mutex<Vec<(String, String)>>,
    next_id: AtomicU64,
}

impl FakeUpstream {
    pub fn with_history(channel_id: &str, ids: impl IntoIterator<Item = u64>) -> Self {
        let upstream = Self::default();
        upstream.extend(channel_id, ids);
        upstream
    }

    pub fn extend(&self, channel_id: &str, ids: impl IntoIterator<Item = u64>) {
        let mut history = self.history.lock().unwrap();
        let channel = history.entry(channel_id.to_string()).or_default();
        channel.extend(ids.into_iter().map(|id| msg(id, channel_id)));
        channel.sort_by(|a, b| snowflake::compare(&a.id, &b.id));
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    fn user_id(&self) -> String {
        BRIDGE_USER.into()
    }

    async fn list_messages(&self, channel_id: &str, query: &HistoryQuery) -> anyhow::Result<Vec<RemoteMessage>> {
        self.list_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let messages = self
            .history
            .lock()
            .unwrap()
            .get(channel_id)
            .cloned()
            .unwrap_or_default();

        let mut page: Vec<RemoteMessage> = match (&query.after, &query.before) {
            (Some(after), _) => messages
                .into_iter()
                .filter(|m| snowflake::compare(&m.id, after) == Ordering::Greater)
                .take(query.limit)
                .collect(),
            (None, before) => {
                let older: Vec<RemoteMessage> = messages
                    .into_iter()
                    .filter(|m| {
                        before
                            .as_deref()
                            .is_none_or(|b| snowflake::compare(&m.id, b) == Ordering::Less)
                    })
                    .collect();
                let start = older.len().saturating_sub(query.limit);
                older[start..].to_vec()
            }
        };
        page.reverse();
        Ok(page)
    }

    async fn send_message(&self, channel_id: &str, message: &OutboundMessage) -> anyhow::Result<RemoteMessage> {
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), message.clone()));
        let id = 10_000 + self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let mut sent = msg(id, channel_id);
        sent.author = RemoteUser {
            id: BRIDGE_USER.into(),
            username: "bridge".into(),
        };
        sent.content = message.content.clone();
        Ok(sent)
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> anyhow::Result<()> {
        self.deleted
            .lock()
            .unwrap()
            .push((channel_id.to_string(), message_id.to_string()));
        Ok(())
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> anyhow::Result<()> {
        self.reactions.lock().unwrap().push((
            channel_id.to_string(),
            message_id.to_string(),
            emoji.to_string(),
            true,
        ));
        Ok(())
    }

    async fn remove_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> anyhow::Result<()> {
        self.reactions.lock().unwrap().push((
            channel_id.to_string(),
            message_id.to_string(),
            emoji.to_string(),
            false,
        ));
        Ok(())
    }

    async fn start_thread(&self, channel_id: &str, root_message_id: &str) -> anyhow::Result<String> {
        self.started_threads
            .lock()
            .unwrap()
            .push((channel_id.to_string(), root_message_id.to_string()));
        Ok(format!("thread-{root_message_id}"))
    }
}

/// Target that records everything it is sent.
#[derive(Default)]
pub struct RecordingTarget {
    pub batch: bool,
    /// Every event in send order, with the ID it was acknowledged as.
    pub log: Mutex<Vec<(String, TargetEvent)>>,
    pub batches: Mutex<Vec<Vec<TargetEvent>>>,
    pub redacted: Mutex<Vec<String>>,
    pub rooms_created: AtomicUsize,
    pub fail_batch: AtomicBool,
    /// 1-based `send_one` call to reject, once. Zero rejects nothing.
    pub fail_send_at: AtomicUsize,
    sends: AtomicUsize,
    counter: AtomicUsize,
}

impl RecordingTarget {
    pub fn new(batch: bool) -> Self {
        Self {
            batch,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<(String, TargetEvent)> {
        self.log.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, e)| body(e)).collect()
    }
}

#[async_trait]
impl Target for RecordingTarget {
    async fn create_room(&self, key: &ChannelKey, _kind: ChannelKind) -> anyhow::Result<String> {
        self.rooms_created.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(format!("!{}:test", key.channel_id))
    }

    async fn send_one(&self, _room_id: &str, event: &TargetEvent) -> anyhow::Result<String> {
        let call = self.sends.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        if self
            .fail_send_at
            .compare_exchange(call, 0, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_ok()
        {
            anyhow::bail!("send rejected");
        }
        let id = format!("$ev{}:test", self.counter.fetch_add(1, AtomicOrdering::SeqCst));
        self.log.lock().unwrap().push((id.clone(), event.clone()));
        Ok(id)
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn send_batch(&self, _room_id: &str, events: &[TargetEvent], forward: bool) -> anyhow::Result<Vec<String>> {
        assert!(forward);
        if self.fail_batch.load(AtomicOrdering::SeqCst) {
            anyhow::bail!("batch rejected");
        }
        self.batches.lock().unwrap().push(events.to_vec());
        let mut log = self.log.lock().unwrap();
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            let id = event
                .id
                .clone()
                .unwrap_or_else(|| format!("$ev{}:test", self.counter.fetch_add(1, AtomicOrdering::SeqCst)));
            log.push((id.clone(), event.clone()));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn redact(&self, _room_id: &str, event_id: &str) -> anyhow::Result<()> {
        self.redacted.lock().unwrap().push(event_id.to_string());
        Ok(())
    }
}

/// One text part per message plus one part per attachment.
/// Content "boom" fails conversion and "panic" panics.
pub struct FakeConverter;

#[async_trait]
impl Converter for FakeConverter {
    fn ghost_id(&self, remote_user_id: &str) -> String {
        format!("@ghost_{remote_user_id}:test")
    }

    fn is_bridge_user(&self, local_user_id: &str) -> bool {
        local_user_id.starts_with("@ghost_")
    }

    async fn update_ghost(&self, user: &RemoteUser) -> anyhow::Result<String> {
        Ok(self.ghost_id(&user.id))
    }

    async fn convert(&self, message: &RemoteMessage, _thread: Option<&ThreadContext>) -> anyhow::Result<Vec<ConvertedPart>> {
        match message.content.as_str() {
            "boom" => anyhow::bail!("unsupported message"),
            "panic" => panic!("converter exploded"),
            _ => {}
        }
        let mut parts = vec![ConvertedPart {
            part_name: String::new(),
            content: serde_json::json!({ "msgtype": "m.text", "body": message.content }),
        }];
        for attachment in &message.attachments {
            parts.push(ConvertedPart {
                part_name: attachment.id.clone(),
                content: serde_json::json!({ "msgtype": "m.file", "body": attachment.filename }),
            });
        }
        Ok(parts)
    }

    async fn convert_local(&self, message: &LocalMessage) -> anyhow::Result<OutboundMessage> {
        Ok(OutboundMessage {
            content: message.content["body"].as_str().unwrap_or_default().to_string(),
            reply_to: None,
        })
    }
}

pub struct Harness {
    pub db: Arc<Database>,
    pub upstream: Arc<FakeUpstream>,
    pub target: Arc<RecordingTarget>,
    pub ctx: SharedContext,
    pub registry: PortalRegistry,
}

impl Harness {
    pub fn new(upstream: FakeUpstream, target: RecordingTarget, config: BridgeConfig) -> Self {
        ferry_sync::logging::init_tracing();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let upstream = Arc::new(upstream);
        let target = Arc::new(target);
        let ctx = BridgeContext::new(
            db.clone(),
            upstream.clone(),
            target.clone(),
            Arc::new(FakeConverter),
            config,
        )
        .unwrap();
        let registry = PortalRegistry::new(ctx.clone());
        Self {
            db,
            upstream,
            target,
            ctx,
            registry,
        }
    }

    /// Give the channel a room without going through room creation.
    pub fn seed_room(&self, key: &ChannelKey) {
        self.db.upsert_portal(key, ChannelKind::Channel).unwrap();
        self.db.set_portal_room(key, ROOM).unwrap();
    }

    /// Record a remote message as already bridged.
    pub fn seed_bridged(&self, key: &ChannelKey, id: u64, thread_id: &str) -> String {
        let local = format!("$seed{id}");
        self.db
            .insert_message(&MessageRecord {
                channel: key.clone(),
                remote_message_id: id.to_string(),
                part_name: String::new(),
                thread_id: thread_id.into(),
                sender_remote_id: "u1".into(),
                sender_local_id: "@ghost_u1:test".into(),
                timestamp: ts(id),
                local_event_id: local.clone(),
            })
            .unwrap();
        local
    }

    pub fn is_bridged(&self, key: &ChannelKey, id: u64) -> bool {
        !self.db.get_by_remote_id(key, &id.to_string()).unwrap().is_empty()
    }
}

pub fn config_with(f: impl FnOnce(&mut BridgeConfig)) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    f(&mut config);
    config
}

/// Poll until `cond` holds, failing the test after a few seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
