use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use chattin_types::models::{Channel, Configuration, Message, User};

use crate::Database;
use crate::models::{
    AvatarRow, ChannelRow, FileMeta, FileRow, MessageRow, USER_COLUMNS, UserRow, message_row,
    parse_id, to_micros, user_row,
};

impl Database {
    // -- Users --

    pub fn create_user(&self, id: Uuid, login: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, login, password) VALUES (?1, ?2, ?3)",
                (id.to_string(), login, password_hash),
            )?;
            Ok(())
        })
    }

    /// Case-insensitive, like login itself.
    pub fn login_exists(&self, login: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE login = ?1)",
                [login],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    /// Includes the password hash; only the login handler needs this.
    pub fn get_user_by_login(&self, login: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users WHERE login = ?1", USER_COLUMNS);
            Ok(conn.query_row(&sql, [login], user_row).optional()?)
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = self.with_conn(|conn| query_user(conn, id))?;
        row.map(User::try_from).transpose()
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let rows = self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users ORDER BY login", USER_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(User::try_from).collect()
    }

    pub fn set_user_online(&self, id: Uuid, online: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET online = ?2 WHERE id = ?1",
                params![id.to_string(), online],
            )?;
            Ok(())
        })
    }

    /// Clear every durable online flag. Returns how many were set.
    pub fn reset_presence(&self) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute("UPDATE users SET online = 0 WHERE online = 1", [])?))
    }

    pub fn set_user_channel(&self, id: Uuid, channel_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET channel_id = ?2 WHERE id = ?1",
                (id.to_string(), channel_id.to_string()),
            )?;
            Ok(())
        })
    }

    /// Returns the updated user, or `None` if it no longer exists.
    pub fn update_profile(&self, id: Uuid, nickname: &str, bio: &str) -> Result<Option<User>> {
        let row = self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET nickname = ?2, bio = ?3 WHERE id = ?1",
                (id.to_string(), nickname, bio),
            )?;
            query_user(conn, id)
        })?;
        row.map(User::try_from).transpose()
    }

    // -- Tokens --

    pub fn insert_token(&self, token: &str, user_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tokens (token, user_id) VALUES (?1, ?2)",
                (token, user_id.to_string()),
            )?;
            Ok(())
        })
    }

    /// Look up the owner of a bearer token. Tokens never expire.
    pub fn resolve_token(&self, token: &str) -> Result<Option<User>> {
        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.login, u.password, u.online, u.channel_id, u.nickname, u.avatar_id, u.bio
                 FROM tokens t
                 JOIN users u ON u.id = t.user_id
                 WHERE t.token = ?1",
            )?;
            Ok(stmt.query_row([token], user_row).optional()?)
        })?;
        row.map(User::try_from).transpose()
    }

    // -- Channels --

    pub fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, nsfw, save_messages FROM channels ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ChannelRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        nsfw: row.get(3)?,
                        save_messages: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(Channel::try_from).collect()
    }

    pub fn get_configuration(&self) -> Result<Configuration> {
        self.with_conn(|conn| {
            let config = conn.query_row(
                "SELECT name, description FROM configuration WHERE id = 1",
                [],
                |row| {
                    Ok(Configuration {
                        name: row.get(0)?,
                        description: row.get(1)?,
                    })
                },
            )?;
            Ok(config)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let row = MessageRow::from(message);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, channel_id, author_id, created_at, edited_at, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id,
                    row.channel_id,
                    row.author_id,
                    row.created_at,
                    row.edited_at,
                    row.content
                ],
            )?;
            Ok(())
        })
    }

    /// Newest first. With a cursor, returns messages strictly older than or
    /// as old as the cursor message, excluding the cursor itself. An unknown
    /// cursor yields an empty page.
    pub fn get_messages(
        &self,
        channel_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel_id, author_id, created_at, edited_at, content
                 FROM messages
                 WHERE channel_id = ?1
                   AND (?2 IS NULL OR (
                        id != ?2
                        AND created_at <= (SELECT created_at FROM messages WHERE id = ?2)))
                 ORDER BY created_at DESC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        channel_id.to_string(),
                        before.map(|id| id.to_string()),
                        limit
                    ],
                    message_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(Message::try_from).collect()
    }

    /// Updates content only where both the id and the author match.
    /// Returns the number of rows changed (0 or 1).
    pub fn edit_message(
        &self,
        id: Uuid,
        author_id: Uuid,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?3, edited_at = ?4
                 WHERE id = ?1 AND author_id = ?2",
                params![
                    id.to_string(),
                    author_id.to_string(),
                    content,
                    to_micros(edited_at)
                ],
            )?;
            Ok(changed)
        })
    }

    /// Deletes only where both the id and the author match.
    pub fn delete_message(&self, id: Uuid, author_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM messages WHERE id = ?1 AND author_id = ?2",
                (id.to_string(), author_id.to_string()),
            )?;
            Ok(changed)
        })
    }

    pub fn count_messages(&self, channel_id: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
                [channel_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // -- Avatars --

    pub fn insert_avatar(&self, avatar: &AvatarRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO avatars (id, user_id, content_type, data) VALUES (?1, ?2, ?3, ?4)",
                params![avatar.id, avatar.user_id, avatar.content_type, avatar.data],
            )?;
            Ok(())
        })
    }

    pub fn get_avatar(&self, id: Uuid) -> Result<Option<AvatarRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, user_id, content_type, data FROM avatars WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok(AvatarRow {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            content_type: row.get(2)?,
                            data: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn list_avatar_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM avatars WHERE user_id = ?1 ORDER BY rowid")?;
            let ids = stmt
                .query_map([user_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        ids.iter().map(|id| parse_id(id)).collect()
    }

    /// Point the user at one of their own avatars, or clear it with `None`.
    /// Returns 0 if the avatar does not belong to the user.
    pub fn select_avatar(&self, user_id: Uuid, avatar_id: Option<Uuid>) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = match avatar_id {
                Some(avatar_id) => conn.execute(
                    "UPDATE users SET avatar_id = ?2
                     WHERE id = ?1
                       AND EXISTS(SELECT 1 FROM avatars WHERE id = ?2 AND user_id = ?1)",
                    (user_id.to_string(), avatar_id.to_string()),
                )?,
                None => conn.execute(
                    "UPDATE users SET avatar_id = NULL WHERE id = ?1",
                    [user_id.to_string()],
                )?,
            };
            Ok(changed)
        })
    }

    /// Owner-only delete. Also clears the user's selection if it pointed here.
    pub fn delete_avatar(&self, id: Uuid, user_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM avatars WHERE id = ?1 AND user_id = ?2",
                (id.to_string(), user_id.to_string()),
            )?;
            if changed > 0 {
                conn.execute(
                    "UPDATE users SET avatar_id = NULL WHERE id = ?1 AND avatar_id = ?2",
                    (user_id.to_string(), id.to_string()),
                )?;
            }
            Ok(changed)
        })
    }

    // -- Files --

    pub fn insert_file(&self, file: &FileRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO files (id, user_id, name, content_type, size, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    file.id,
                    file.user_id,
                    file.name,
                    file.content_type,
                    file.size,
                    file.data
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_file(&self, id: Uuid) -> Result<Option<FileRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, user_id, name, content_type, size, data FROM files WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok(FileRow {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            name: row.get(2)?,
                            content_type: row.get(3)?,
                            size: row.get(4)?,
                            data: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_file_meta(&self, id: Uuid) -> Result<Option<FileMeta>> {
        self.with_conn(|conn| {
            let meta = conn
                .query_row(
                    "SELECT name, content_type, size FROM files WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok(FileMeta {
                            name: row.get(0)?,
                            content_type: row.get(1)?,
                            size: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(meta)
        })
    }
}

fn query_user(conn: &Connection, id: Uuid) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, [id.to_string()], user_row).optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const GENERAL: &str = "00000000-0000-0000-0000-000000000001";

    fn general() -> Uuid {
        GENERAL.parse().unwrap()
    }

    fn user(db: &Database, login: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(id, login, "hash").unwrap();
        id
    }

    fn message_at(channel_id: Uuid, author_id: Uuid, secs: i64, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            channel_id,
            author_id,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            edited_at: None,
            content: content.into(),
        }
    }

    #[test]
    fn duplicate_login_is_a_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        user(&db, "alice");

        let err = db.create_user(Uuid::new_v4(), "ALICE", "hash").unwrap_err();
        assert!(crate::is_unique_violation(&err));
        assert!(!crate::is_unique_violation(&anyhow::anyhow!("unrelated")));
    }

    #[test]
    fn seeds_channels_and_configuration() {
        let db = Database::open_in_memory().unwrap();
        let channels = db.list_channels().unwrap();
        let names: Vec<_> = channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["general", "dev", "tmp"]);
        assert!(channels[0].save_messages);
        assert!(!channels[2].save_messages);
        assert_eq!(db.get_configuration().unwrap().name, "Chattin");
    }

    #[test]
    fn login_lookup_ignores_case() {
        let db = Database::open_in_memory().unwrap();
        user(&db, "Alice");
        assert!(db.login_exists("alice").unwrap());
        assert!(db.get_user_by_login("ALICE").unwrap().is_some());
        assert!(!db.login_exists("bob").unwrap());
    }

    #[test]
    fn resolves_token_to_user() {
        let db = Database::open_in_memory().unwrap();
        let id = user(&db, "alice");
        db.insert_token("tok", id).unwrap();

        let resolved = db.resolve_token("tok").unwrap().unwrap();
        assert_eq!(resolved.id, id);
        assert_eq!(resolved.login, "alice");
        assert!(db.resolve_token("nope").unwrap().is_none());
    }

    #[test]
    fn presence_flag_and_reset() {
        let db = Database::open_in_memory().unwrap();
        let id = user(&db, "alice");
        db.set_user_online(id, true).unwrap();
        assert!(db.get_user(id).unwrap().unwrap().online);
        assert_eq!(db.reset_presence().unwrap(), 1);
        assert!(!db.get_user(id).unwrap().unwrap().online);
    }

    #[test]
    fn pages_newest_first_with_hard_cap() {
        let db = Database::open_in_memory().unwrap();
        let author = user(&db, "alice");
        let m1 = message_at(general(), author, 100, "t1");
        let m2 = message_at(general(), author, 200, "t2");
        let m3 = message_at(general(), author, 300, "t3");
        for m in [&m1, &m2, &m3] {
            db.insert_message(m).unwrap();
        }

        let page = db.get_messages(general(), None, 2).unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["t3", "t2"]);

        let older = db.get_messages(general(), Some(m2.id), 10).unwrap();
        assert_eq!(older, vec![m1]);

        assert!(db.get_messages(general(), Some(Uuid::new_v4()), 10).unwrap().is_empty());
    }

    #[test]
    fn edit_and_delete_require_author() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let m = message_at(general(), alice, 100, "original");
        db.insert_message(&m).unwrap();
        let at = Utc.timestamp_opt(500, 0).unwrap();

        assert_eq!(db.edit_message(m.id, bob, "x", at).unwrap(), 0);
        assert_eq!(db.delete_message(m.id, bob).unwrap(), 0);

        assert_eq!(db.edit_message(m.id, alice, "x", at).unwrap(), 1);
        let stored = &db.get_messages(general(), None, 1).unwrap()[0];
        assert_eq!(stored.content, "x");
        assert_eq!(stored.edited_at, Some(at));

        assert_eq!(db.delete_message(m.id, alice).unwrap(), 1);
        assert_eq!(db.count_messages(general()).unwrap(), 0);
    }

    #[test]
    fn avatar_selection_is_owner_only() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let avatar_id = Uuid::new_v4();
        db.insert_avatar(&AvatarRow {
            id: avatar_id.to_string(),
            user_id: alice.to_string(),
            content_type: "image/png".into(),
            data: vec![1, 2, 3],
        })
        .unwrap();

        assert_eq!(db.select_avatar(bob, Some(avatar_id)).unwrap(), 0);
        assert_eq!(db.select_avatar(alice, Some(avatar_id)).unwrap(), 1);
        assert_eq!(db.list_avatar_ids(alice).unwrap(), vec![avatar_id]);

        assert_eq!(db.delete_avatar(avatar_id, bob).unwrap(), 0);
        assert_eq!(db.delete_avatar(avatar_id, alice).unwrap(), 1);
        assert_eq!(db.get_user(alice).unwrap().unwrap().avatar_id, None);
    }
}
