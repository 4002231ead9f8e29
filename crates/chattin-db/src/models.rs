//! Database row types. These map directly to SQLite rows and stay distinct
//! from the chattin-types wire models; ids are stored as text.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use chattin_types::models::{Channel, Message, User};

pub struct UserRow {
    pub id: String,
    pub login: String,
    pub password: String,
    pub online: bool,
    pub channel_id: Option<String>,
    pub nickname: String,
    pub avatar_id: Option<String>,
    pub bio: String,
}

pub struct ChannelRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub nsfw: bool,
    pub save_messages: bool,
}

pub struct MessageRow {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub created_at: i64,
    pub edited_at: Option<i64>,
    pub content: String,
}

pub struct AvatarRow {
    pub id: String,
    pub user_id: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

pub struct FileRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub content_type: String,
    pub size: i64,
    pub data: Vec<u8>,
}

/// File metadata without the blob.
pub struct FileMeta {
    pub name: String,
    pub content_type: String,
    pub size: i64,
}

pub(crate) const USER_COLUMNS: &str =
    "id, login, password, online, channel_id, nickname, avatar_id, bio";

pub(crate) fn user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        login: row.get(1)?,
        password: row.get(2)?,
        online: row.get(3)?,
        channel_id: row.get(4)?,
        nickname: row.get(5)?,
        avatar_id: row.get(6)?,
        bio: row.get(7)?,
    })
}

pub(crate) fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        author_id: row.get(2)?,
        created_at: row.get(3)?,
        edited_at: row.get(4)?,
        content: row.get(5)?,
    })
}

pub fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id '{}'", raw))
}

fn parse_opt_id(raw: Option<&str>) -> Result<Option<Uuid>> {
    raw.filter(|s| !s.is_empty()).map(parse_id).transpose()
}

pub fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .with_context(|| format!("timestamp out of range: {}", micros))
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: parse_id(&row.id)?,
            login: row.login,
            online: row.online,
            channel_id: parse_opt_id(row.channel_id.as_deref())?,
            nickname: row.nickname,
            avatar_id: parse_opt_id(row.avatar_id.as_deref())?,
            bio: row.bio,
        })
    }
}

impl TryFrom<ChannelRow> for Channel {
    type Error = anyhow::Error;

    fn try_from(row: ChannelRow) -> Result<Self> {
        Ok(Channel {
            id: parse_id(&row.id)?,
            name: row.name,
            description: row.description,
            nsfw: row.nsfw,
            save_messages: row.save_messages,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: parse_id(&row.id)?,
            channel_id: parse_id(&row.channel_id)?,
            author_id: parse_id(&row.author_id)?,
            created_at: from_micros(row.created_at)?,
            edited_at: row.edited_at.map(from_micros).transpose()?,
            content: row.content,
        })
    }
}

impl From<&Message> for MessageRow {
    fn from(message: &Message) -> Self {
        MessageRow {
            id: message.id.to_string(),
            channel_id: message.channel_id.to_string(),
            author_id: message.author_id.to_string(),
            created_at: to_micros(message.created_at),
            edited_at: message.edited_at.map(to_micros),
            content: message.content.clone(),
        }
    }
}
