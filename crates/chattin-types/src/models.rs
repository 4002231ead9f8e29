use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered account as seen by other clients.
///
/// The password hash lives only in the database row type and never
/// reaches this struct. The current channel is private to the owner and
/// is handed out in the auth reply instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub login: String,
    pub online: bool,
    #[serde(skip)]
    pub channel_id: Option<Uuid>,
    pub nickname: String,
    pub avatar_id: Option<Uuid>,
    pub bio: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub nsfw: bool,
    /// Broadcast-only channels keep nothing on disk.
    pub save_messages: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub content: String,
}

/// Server branding shown by clients before login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub name: String,
    pub description: String,
}

/// Find a channel by id in the startup channel list.
pub fn find_channel(channels: &[Channel], id: Uuid) -> Option<&Channel> {
    channels.iter().find(|c| c.id == id)
}
