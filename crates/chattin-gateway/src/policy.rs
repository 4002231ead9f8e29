//! Session state machine, packet admission and routing rules.
//!
//! Edit and delete ownership is not decided here: the database matches on
//! message id and author id in a single statement, so there is no read
//! before the write.

use chattin_types::packet::{ClientPacket, ServerPacket};
use uuid::Uuid;

/// States in which a session reads packets. A connection is upgraded before
/// its first read and reads nothing once closed, so neither end of the
/// `Connecting -> Authenticating -> Active -> Closed` lifecycle appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Only the first frame is read here; it must be an auth packet.
    Authenticating,
    Active,
}

/// What to do with an inbound packet in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Log and keep the connection.
    Drop,
    /// Protocol violation that ends the session.
    Close,
}

pub fn admit(state: SessionState, packet: &ClientPacket) -> Admission {
    match (state, packet) {
        (SessionState::Authenticating, ClientPacket::Auth(_)) => Admission::Accept,
        (SessionState::Authenticating, _) => Admission::Close,
        (SessionState::Active, ClientPacket::Auth(_) | ClientPacket::Unknown(_)) => Admission::Drop,
        (SessionState::Active, _) => Admission::Accept,
    }
}

/// Where an accepted packet is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Read-only query answered by the session itself.
    Direct,
    /// Needs the registry or fans out; goes through the hub queue.
    Hub,
}

pub fn dispatch(packet: &ClientPacket) -> Dispatch {
    match packet {
        ClientPacket::ChannelList | ClientPacket::GetMessages(_) | ClientPacket::UserList => {
            Dispatch::Direct
        }
        _ => Dispatch::Hub,
    }
}

pub fn presence(user_id: Uuid, online: bool) -> ServerPacket {
    if online {
        ServerPacket::OnlineUsers(vec![user_id])
    } else {
        ServerPacket::OfflineUsers(vec![user_id])
    }
}

/// Client `count` is a hard cap; the server cap applies on top.
pub fn page_size(requested: u32, server_cap: u32) -> u32 {
    requested.min(server_cap)
}

pub fn valid_content(content: &str, max_len: usize) -> bool {
    !content.trim().is_empty() && content.chars().count() <= max_len
}
