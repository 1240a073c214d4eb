use crate::Database;
use crate::models::{MessageRecord, PortalRecord, ReactionRecord, ThreadRecord};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use ferry_types::models::{ChannelKey, ChannelKind};
use rusqlite::{Connection, Row, Statement, params};
use tracing::warn;

const MESSAGE_COLUMNS: &str = "channel_id, receiver_id, remote_message_id, part_name, thread_id,
     sender_remote_id, sender_local_id, timestamp, local_event_id";

const INSERT_MESSAGE: &str = "INSERT INTO messages (channel_id, receiver_id, remote_message_id, part_name,
     thread_id, sender_remote_id, sender_local_id, timestamp, local_event_id)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const THREAD_COLUMNS: &str = "thread_remote_id, parent_channel_id, root_remote_message_id,
     root_local_event_id, join_notice_local_event_id";

const REACTION_COLUMNS: &str =
    "channel_id, receiver_id, remote_message_id, sender_remote_id, emoji, local_event_id";

impl Database {
    // -- Messages --

    /// Most recent message recorded at channel level. Thread messages are not
    /// considered; use `get_last_in_thread` for those.
    pub fn get_last(&self, key: &ChannelKey) -> Result<Option<MessageRecord>> {
        self.with_conn(|conn| query_last(conn, key, ""))
    }

    pub fn get_last_in_thread(&self, key: &ChannelKey, thread_id: &str) -> Result<Option<MessageRecord>> {
        self.with_conn(|conn| query_last(conn, key, thread_id))
    }

    /// All parts recorded for a remote message, primary part first.
    pub fn get_by_remote_id(&self, key: &ChannelKey, remote_id: &str) -> Result<Vec<MessageRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE channel_id = ?1 AND receiver_id = ?2 AND remote_message_id = ?3
                 ORDER BY part_name"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![key.channel_id, key.receiver_id, remote_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_by_local_id(&self, key: &ChannelKey, local_id: &str) -> Result<Option<MessageRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE channel_id = ?1 AND receiver_id = ?2 AND local_event_id = ?3"
            );
            conn.query_row(&sql, params![key.channel_id, key.receiver_id, local_id], message_from_row)
                .optional()
        })
    }

    pub fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(INSERT_MESSAGE)?;
            execute_insert(&mut stmt, record).map_err(|e| {
                anyhow!(
                    "Failed to record message {} part '{}' in {}: {}",
                    record.remote_message_id,
                    record.part_name,
                    record.channel,
                    e
                )
            })?;
            Ok(())
        })
    }

    /// Insert a batch of records in one transaction. Either every record is
    /// stored or none is.
    pub fn bulk_insert_messages(&self, records: &[MessageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(INSERT_MESSAGE)?;
                for record in records {
                    execute_insert(&mut stmt, record).map_err(|e| {
                        anyhow!(
                            "Batch insert failed at message {} part '{}': {}",
                            record.remote_message_id,
                            record.part_name,
                            e
                        )
                    })?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Forget every part of a remote message. Returns the number of rows removed.
    pub fn delete_all_messages(&self, key: &ChannelKey, remote_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM messages WHERE channel_id = ?1 AND receiver_id = ?2 AND remote_message_id = ?3",
                params![key.channel_id, key.receiver_id, remote_id],
            )?;
            Ok(removed)
        })
    }

    // -- Threads --

    pub fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE thread_remote_id = ?1");
            conn.query_row(&sql, [thread_id], thread_from_row).optional()
        })
    }

    /// Find the thread anchored by a local event, either its root or its join notice.
    pub fn get_thread_by_local_event(
        &self,
        parent_channel_id: &str,
        local_id: &str,
    ) -> Result<Option<ThreadRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {THREAD_COLUMNS} FROM threads
                 WHERE parent_channel_id = ?1
                   AND (root_local_event_id = ?2 OR join_notice_local_event_id = ?2)"
            );
            conn.query_row(&sql, params![parent_channel_id, local_id], thread_from_row)
                .optional()
        })
    }

    /// Returns false if the thread was already known.
    pub fn insert_thread(&self, thread: &ThreadRecord) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO threads (thread_remote_id, parent_channel_id, root_remote_message_id,
                     root_local_event_id, join_notice_local_event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    thread.thread_remote_id,
                    thread.parent_channel_id,
                    thread.root_remote_message_id,
                    thread.root_local_event_id,
                    thread.join_notice_local_event_id,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Set the thread's root event. Only the first call has an effect.
    pub fn set_thread_root_local(&self, thread_id: &str, local_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE threads SET root_local_event_id = ?2
                 WHERE thread_remote_id = ?1 AND root_local_event_id IS NULL",
                params![thread_id, local_id],
            )?;
            Ok(updated > 0)
        })
    }

    /// Set the thread's join notice event. Only the first call has an effect.
    pub fn set_thread_join_notice(&self, thread_id: &str, local_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE threads SET join_notice_local_event_id = ?2
                 WHERE thread_remote_id = ?1 AND join_notice_local_event_id IS NULL",
                params![thread_id, local_id],
            )?;
            Ok(updated > 0)
        })
    }

    // -- Reactions --

    pub fn get_reaction(
        &self,
        key: &ChannelKey,
        remote_message_id: &str,
        sender_remote_id: &str,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {REACTION_COLUMNS} FROM reactions
                 WHERE channel_id = ?1 AND receiver_id = ?2 AND remote_message_id = ?3
                   AND sender_remote_id = ?4 AND emoji = ?5"
            );
            conn.query_row(
                &sql,
                params![key.channel_id, key.receiver_id, remote_message_id, sender_remote_id, emoji],
                reaction_from_row,
            )
            .optional()
        })
    }

    pub fn get_reaction_by_local_id(&self, key: &ChannelKey, local_id: &str) -> Result<Option<ReactionRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {REACTION_COLUMNS} FROM reactions
                 WHERE channel_id = ?1 AND receiver_id = ?2 AND local_event_id = ?3"
            );
            conn.query_row(&sql, params![key.channel_id, key.receiver_id, local_id], reaction_from_row)
                .optional()
        })
    }

    pub fn insert_reaction(&self, reaction: &ReactionRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reactions (channel_id, receiver_id, remote_message_id, sender_remote_id, emoji, local_event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    reaction.channel.channel_id,
                    reaction.channel.receiver_id,
                    reaction.remote_message_id,
                    reaction.sender_remote_id,
                    reaction.emoji,
                    reaction.local_event_id,
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_reaction(&self, reaction: &ReactionRecord) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM reactions
                 WHERE channel_id = ?1 AND receiver_id = ?2 AND remote_message_id = ?3
                   AND sender_remote_id = ?4 AND emoji = ?5",
                params![
                    reaction.channel.channel_id,
                    reaction.channel.receiver_id,
                    reaction.remote_message_id,
                    reaction.sender_remote_id,
                    reaction.emoji,
                ],
            )?;
            Ok(removed > 0)
        })
    }

    // -- Portals --

    pub fn get_portal(&self, key: &ChannelKey) -> Result<Option<PortalRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT channel_id, receiver_id, kind, room_id FROM portals
                 WHERE channel_id = ?1 AND receiver_id = ?2",
                params![key.channel_id, key.receiver_id],
                portal_from_row,
            )
            .optional()
        })
    }

    pub fn get_portal_by_room(&self, room_id: &str) -> Result<Option<PortalRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT channel_id, receiver_id, kind, room_id FROM portals WHERE room_id = ?1",
                [room_id],
                portal_from_row,
            )
            .optional()
        })
    }

    /// Load the portal row for a channel, creating it if this is the first time
    /// the channel is seen. An existing row keeps its original kind.
    pub fn upsert_portal(&self, key: &ChannelKey, kind: ChannelKind) -> Result<PortalRecord> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO portals (channel_id, receiver_id, kind) VALUES (?1, ?2, ?3)",
                params![key.channel_id, key.receiver_id, kind.as_str()],
            )?;
            conn.query_row(
                "SELECT channel_id, receiver_id, kind, room_id FROM portals
                 WHERE channel_id = ?1 AND receiver_id = ?2",
                params![key.channel_id, key.receiver_id],
                portal_from_row,
            )
            .map_err(Into::into)
        })
    }

    pub fn set_portal_room(&self, key: &ChannelKey, room_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE portals SET room_id = ?3 WHERE channel_id = ?1 AND receiver_id = ?2",
                params![key.channel_id, key.receiver_id, room_id],
            )?;
            if updated == 0 {
                return Err(anyhow!("Portal not found: {}", key));
            }
            Ok(())
        })
    }
}

fn query_last(conn: &Connection, key: &ChannelKey, thread_id: &str) -> Result<Option<MessageRecord>> {
    // Ties on timestamp fall back to ID order, then to insertion order so the
    // last part sent for a message wins.
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE channel_id = ?1 AND receiver_id = ?2 AND thread_id = ?3
         ORDER BY timestamp DESC, length(remote_message_id) DESC, remote_message_id DESC, rowid DESC
         LIMIT 1"
    );
    conn.query_row(&sql, params![key.channel_id, key.receiver_id, thread_id], message_from_row)
        .optional()
}

fn execute_insert(stmt: &mut Statement<'_>, record: &MessageRecord) -> rusqlite::Result<usize> {
    stmt.execute(params![
        record.channel.channel_id,
        record.channel.receiver_id,
        record.remote_message_id,
        record.part_name,
        record.thread_id,
        record.sender_remote_id,
        record.sender_local_id,
        record.timestamp.timestamp_millis(),
        record.local_event_id,
    ])
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        channel: ChannelKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        remote_message_id: row.get(2)?,
        part_name: row.get(3)?,
        thread_id: row.get(4)?,
        sender_remote_id: row.get(5)?,
        sender_local_id: row.get(6)?,
        timestamp: from_millis(row.get(7)?),
        local_event_id: row.get(8)?,
    })
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadRecord> {
    Ok(ThreadRecord {
        thread_remote_id: row.get(0)?,
        parent_channel_id: row.get(1)?,
        root_remote_message_id: row.get(2)?,
        root_local_event_id: row.get(3)?,
        join_notice_local_event_id: row.get(4)?,
    })
}

fn reaction_from_row(row: &Row<'_>) -> rusqlite::Result<ReactionRecord> {
    Ok(ReactionRecord {
        channel: ChannelKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        remote_message_id: row.get(2)?,
        sender_remote_id: row.get(3)?,
        emoji: row.get(4)?,
        local_event_id: row.get(5)?,
    })
}

fn portal_from_row(row: &Row<'_>) -> rusqlite::Result<PortalRecord> {
    let channel = ChannelKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
    let kind_str: String = row.get(2)?;
    let kind = ChannelKind::parse(&kind_str).unwrap_or_else(|| {
        warn!("Corrupt kind '{}' on portal {}", kind_str, channel);
        ChannelKind::Channel
    });

    Ok(PortalRecord {
        channel,
        kind,
        room_id: row.get(3)?,
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(|| {
        warn!("Corrupt timestamp {}", ms);
        DateTime::default()
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
