use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE portals (
                channel_id      TEXT NOT NULL,
                receiver_id     TEXT NOT NULL DEFAULT '',
                kind            TEXT NOT NULL,
                room_id         TEXT UNIQUE,
                PRIMARY KEY (channel_id, receiver_id)
            );

            -- One row per local event produced from a remote message.
            -- thread_id is '' for messages that are not in a thread.
            CREATE TABLE messages (
                channel_id          TEXT NOT NULL,
                receiver_id         TEXT NOT NULL DEFAULT '',
                remote_message_id   TEXT NOT NULL,
                part_name           TEXT NOT NULL DEFAULT '',
                thread_id           TEXT NOT NULL DEFAULT '',
                sender_remote_id    TEXT NOT NULL,
                sender_local_id     TEXT NOT NULL,
                timestamp           INTEGER NOT NULL,
                local_event_id      TEXT NOT NULL,
                PRIMARY KEY (channel_id, receiver_id, remote_message_id, part_name),
                UNIQUE (channel_id, receiver_id, local_event_id)
            );

            CREATE INDEX idx_messages_recent
                ON messages(channel_id, receiver_id, thread_id, timestamp);

            CREATE TABLE threads (
                thread_remote_id            TEXT PRIMARY KEY,
                parent_channel_id           TEXT NOT NULL,
                root_remote_message_id      TEXT NOT NULL,
                root_local_event_id         TEXT,
                join_notice_local_event_id  TEXT
            );

            CREATE INDEX idx_threads_parent
                ON threads(parent_channel_id);

            CREATE TABLE reactions (
                channel_id          TEXT NOT NULL,
                receiver_id         TEXT NOT NULL DEFAULT '',
                remote_message_id   TEXT NOT NULL,
                sender_remote_id    TEXT NOT NULL,
                emoji               TEXT NOT NULL,
                local_event_id      TEXT NOT NULL,
                PRIMARY KEY (channel_id, receiver_id, remote_message_id, sender_remote_id, emoji),
                UNIQUE (channel_id, receiver_id, local_event_id)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
