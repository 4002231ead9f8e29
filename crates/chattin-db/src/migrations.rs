use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE configuration (
                id          INTEGER PRIMARY KEY CHECK (id = 1),
                name        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                login       TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password    TEXT NOT NULL,
                online      INTEGER NOT NULL DEFAULT 0,
                channel_id  TEXT,
                nickname    TEXT NOT NULL DEFAULT '',
                avatar_id   TEXT,
                bio         TEXT NOT NULL DEFAULT '',
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE tokens (
                token       TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE channels (
                id            TEXT PRIMARY KEY,
                name          TEXT NOT NULL UNIQUE,
                description   TEXT NOT NULL DEFAULT '',
                nsfw          INTEGER NOT NULL DEFAULT 0,
                save_messages INTEGER NOT NULL DEFAULT 1
            );

            -- Timestamps are microseconds since the Unix epoch.
            CREATE TABLE messages (
                id          TEXT PRIMARY KEY,
                channel_id  TEXT NOT NULL REFERENCES channels(id),
                author_id   TEXT NOT NULL REFERENCES users(id),
                created_at  INTEGER NOT NULL,
                edited_at   INTEGER,
                content     TEXT NOT NULL
            );

            CREATE INDEX idx_messages_channel
                ON messages(channel_id, created_at);

            CREATE TABLE avatars (
                id            TEXT PRIMARY KEY,
                user_id       TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                content_type  TEXT NOT NULL,
                data          BLOB NOT NULL
            );

            CREATE INDEX idx_avatars_user ON avatars(user_id);

            CREATE TABLE files (
                id            TEXT PRIMARY KEY,
                user_id       TEXT NOT NULL REFERENCES users(id),
                name          TEXT NOT NULL,
                content_type  TEXT NOT NULL,
                size          INTEGER NOT NULL,
                data          BLOB NOT NULL,
                created_at    TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO configuration (id, name, description) VALUES (1, 'Chattin', '');

            INSERT INTO channels (id, name, description, nsfw, save_messages) VALUES
                ('00000000-0000-0000-0000-000000000001', 'general', 'General channel', 0, 1),
                ('00000000-0000-0000-0000-000000000002', 'dev', 'Development channel', 0, 1),
                ('00000000-0000-0000-0000-000000000003', 'tmp', 'Messages sent in this channel won''t be saved', 0, 0);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
