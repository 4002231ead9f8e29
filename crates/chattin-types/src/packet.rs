//! WebSocket packet codec.
//!
//! Every frame is a JSON envelope `{"type": <int>, "data": <payload>}`. The
//! payload shape depends on the kind, so decoding happens in two steps: the
//! envelope first, then the payload into the variant selected by the tag.
//! A payload that does not match its kind is a decode error; a kind this
//! side does not know decodes to `Unknown` so the caller can log and drop it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Channel, Message, User};

/// Stable numeric packet kinds. Values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Auth = 0,
    /// Online-users query reply, and the presence-online broadcast.
    OnlineUsers = 1,
    OfflineUsers = 2,
    AddUsers = 3,
    /// Reserved, never emitted.
    RemoveUsers = 4,
    UpdateUsers = 5,
    Message = 6,
    SetChannel = 7,
    Typing = 8,
    DeleteMessage = 9,
    EditMessage = 10,
    ChannelList = 11,
    GetMessages = 12,
    UserList = 13,
}

impl PacketKind {
    pub const fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let kind = match code {
            0 => Self::Auth,
            1 => Self::OnlineUsers,
            2 => Self::OfflineUsers,
            3 => Self::AddUsers,
            4 => Self::RemoveUsers,
            5 => Self::UpdateUsers,
            6 => Self::Message,
            7 => Self::SetChannel,
            8 => Self::Typing,
            9 => Self::DeleteMessage,
            10 => Self::EditMessage,
            11 => Self::ChannelList,
            12 => Self::GetMessages,
            13 => Self::UserList,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed packet envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("bad payload for {kind:?} packet: {source}")]
    Payload {
        kind: PacketKind,
        source: serde_json::Error,
    },

    #[error("packet kind {0} is not valid in this direction")]
    UnexpectedKind(i64),

    #[error("failed to encode packet: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: i64,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: i64,
    data: &'a T,
}

// -- Payloads --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthReply {
    pub user_id: Uuid,
    pub channel_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub channel_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessages {
    pub channel_id: Uuid,
    #[serde(default)]
    pub from_message_id: Option<Uuid>,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub message_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEdited {
    pub message_id: Uuid,
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

/// Packets sent FROM client TO server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    /// Bearer token; only valid as the first frame.
    Auth(String),
    OnlineUsers,
    ChannelList,
    UserList,
    SendMessage(SendMessage),
    GetMessages(GetMessages),
    EditMessage(EditMessage),
    DeleteMessage(Uuid),
    SetChannel(Uuid),
    /// Channel the sender is typing in.
    Typing(Uuid),
    /// Any kind the server does not accept from clients.
    Unknown(i64),
}

impl ClientPacket {
    pub fn kind(&self) -> Option<PacketKind> {
        let kind = match self {
            Self::Auth(_) => PacketKind::Auth,
            Self::OnlineUsers => PacketKind::OnlineUsers,
            Self::ChannelList => PacketKind::ChannelList,
            Self::UserList => PacketKind::UserList,
            Self::SendMessage(_) => PacketKind::Message,
            Self::GetMessages(_) => PacketKind::GetMessages,
            Self::EditMessage(_) => PacketKind::EditMessage,
            Self::DeleteMessage(_) => PacketKind::DeleteMessage,
            Self::SetChannel(_) => PacketKind::SetChannel,
            Self::Typing(_) => PacketKind::Typing,
            Self::Unknown(_) => return None,
        };
        Some(kind)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let Envelope { kind: code, data } =
            serde_json::from_str(text).map_err(CodecError::Envelope)?;

        let Some(kind) = PacketKind::from_code(code) else {
            return Ok(Self::Unknown(code));
        };

        let packet = match kind {
            PacketKind::Auth => Self::Auth(payload(kind, data)?),
            PacketKind::OnlineUsers => Self::OnlineUsers,
            PacketKind::ChannelList => Self::ChannelList,
            PacketKind::UserList => Self::UserList,
            PacketKind::Message => Self::SendMessage(payload(kind, data)?),
            PacketKind::GetMessages => Self::GetMessages(payload(kind, data)?),
            PacketKind::EditMessage => Self::EditMessage(payload(kind, data)?),
            PacketKind::DeleteMessage => Self::DeleteMessage(payload(kind, data)?),
            PacketKind::SetChannel => Self::SetChannel(payload(kind, data)?),
            PacketKind::Typing => Self::Typing(payload(kind, data)?),
            PacketKind::OfflineUsers
            | PacketKind::AddUsers
            | PacketKind::RemoveUsers
            | PacketKind::UpdateUsers => Self::Unknown(code),
        };
        Ok(packet)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        match self {
            Self::Auth(token) => envelope(PacketKind::Auth.code(), token),
            Self::OnlineUsers => envelope(PacketKind::OnlineUsers.code(), &()),
            Self::ChannelList => envelope(PacketKind::ChannelList.code(), &()),
            Self::UserList => envelope(PacketKind::UserList.code(), &()),
            Self::SendMessage(p) => envelope(PacketKind::Message.code(), p),
            Self::GetMessages(p) => envelope(PacketKind::GetMessages.code(), p),
            Self::EditMessage(p) => envelope(PacketKind::EditMessage.code(), p),
            Self::DeleteMessage(id) => envelope(PacketKind::DeleteMessage.code(), id),
            Self::SetChannel(id) => envelope(PacketKind::SetChannel.code(), id),
            Self::Typing(id) => envelope(PacketKind::Typing.code(), id),
            Self::Unknown(code) => envelope(*code, &()),
        }
    }
}

/// Packets sent FROM server TO client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    /// `None` is the auth-failure reply, encoded as `false`.
    Auth(Option<AuthReply>),
    OnlineUsers(Vec<Uuid>),
    OfflineUsers(Vec<Uuid>),
    AddUsers(Vec<User>),
    UpdateUsers(Vec<User>),
    Message(Message),
    MessageDeleted(Uuid),
    MessageEdited(MessageEdited),
    /// (channel id, user id)
    Typing(Uuid, Uuid),
    ChannelList(Vec<Channel>),
    Messages(Vec<Message>),
    UserList(Vec<User>),
}

impl ServerPacket {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Auth(_) => PacketKind::Auth,
            Self::OnlineUsers(_) => PacketKind::OnlineUsers,
            Self::OfflineUsers(_) => PacketKind::OfflineUsers,
            Self::AddUsers(_) => PacketKind::AddUsers,
            Self::UpdateUsers(_) => PacketKind::UpdateUsers,
            Self::Message(_) => PacketKind::Message,
            Self::MessageDeleted(_) => PacketKind::DeleteMessage,
            Self::MessageEdited(_) => PacketKind::EditMessage,
            Self::Typing(..) => PacketKind::Typing,
            Self::ChannelList(_) => PacketKind::ChannelList,
            Self::Messages(_) => PacketKind::GetMessages,
            Self::UserList(_) => PacketKind::UserList,
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        let code = self.kind().code();
        match self {
            Self::Auth(Some(reply)) => envelope(code, reply),
            Self::Auth(None) => envelope(code, &false),
            Self::OnlineUsers(ids) | Self::OfflineUsers(ids) => envelope(code, ids),
            Self::AddUsers(users) | Self::UpdateUsers(users) | Self::UserList(users) => {
                envelope(code, users)
            }
            Self::Message(message) => envelope(code, message),
            Self::MessageDeleted(id) => envelope(code, id),
            Self::MessageEdited(edit) => envelope(code, edit),
            Self::Typing(channel_id, user_id) => envelope(code, &(channel_id, user_id)),
            Self::ChannelList(channels) => envelope(code, channels),
            Self::Messages(messages) => envelope(code, messages),
        }
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let Envelope { kind: code, data } =
            serde_json::from_str(text).map_err(CodecError::Envelope)?;
        let kind = PacketKind::from_code(code).ok_or(CodecError::UnexpectedKind(code))?;

        let packet = match kind {
            PacketKind::Auth => match data {
                Value::Bool(false) => Self::Auth(None),
                data => Self::Auth(Some(payload(kind, data)?)),
            },
            PacketKind::OnlineUsers => Self::OnlineUsers(payload(kind, data)?),
            PacketKind::OfflineUsers => Self::OfflineUsers(payload(kind, data)?),
            PacketKind::AddUsers => Self::AddUsers(payload(kind, data)?),
            PacketKind::UpdateUsers => Self::UpdateUsers(payload(kind, data)?),
            PacketKind::Message => Self::Message(payload(kind, data)?),
            PacketKind::DeleteMessage => Self::MessageDeleted(payload(kind, data)?),
            PacketKind::EditMessage => Self::MessageEdited(payload(kind, data)?),
            PacketKind::Typing => {
                let (channel_id, user_id) = payload(kind, data)?;
                Self::Typing(channel_id, user_id)
            }
            PacketKind::ChannelList => Self::ChannelList(payload(kind, data)?),
            PacketKind::GetMessages => Self::Messages(payload(kind, data)?),
            PacketKind::UserList => Self::UserList(payload(kind, data)?),
            PacketKind::SetChannel | PacketKind::RemoveUsers => {
                return Err(CodecError::UnexpectedKind(code));
            }
        };
        Ok(packet)
    }
}

fn payload<T: DeserializeOwned>(kind: PacketKind, data: Value) -> Result<T, CodecError> {
    serde_json::from_value(data).map_err(|source| CodecError::Payload { kind, source })
}

fn envelope<T: Serialize>(kind: i64, data: &T) -> Result<String, CodecError> {
    serde_json::to_string(&EnvelopeRef { kind, data }).map_err(CodecError::Encode)
}
