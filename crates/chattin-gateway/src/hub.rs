//! The hub owns the session registry and serializes every state change.
//!
//! Sessions and the HTTP layer talk to it through a [`HubHandle`]. Events are
//! applied one at a time in arrival order, so two broadcasts never reach
//! different sessions in different orders.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use chrono::{SubsecRound, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use chattin_types::models::{Message, User};
use chattin_types::packet::{ClientPacket, EditMessage, MessageEdited, SendMessage, ServerPacket};

use crate::context::GatewayContext;
use crate::policy;
use crate::session::{SessionHandle, SessionId};

#[derive(Debug)]
pub enum HubEvent {
    Register(SessionHandle),
    Unregister(SessionId),
    /// A packet from an active session that needs the registry or fans out.
    Route {
        session: SessionId,
        packet: ClientPacket,
    },
    /// Fan a server packet out to every session, e.g. from an HTTP handler.
    Broadcast(ServerPacket),
}

/// Cheap, cloneable sender side of the hub queue.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubEvent>,
}

impl HubHandle {
    pub fn submit(&self, event: HubEvent) {
        if self.tx.send(event).is_err() {
            warn!("Hub is gone, event dropped");
        }
    }

    pub fn register(&self, session: SessionHandle) {
        self.submit(HubEvent::Register(session));
    }

    pub fn unregister(&self, session: SessionId) {
        self.submit(HubEvent::Unregister(session));
    }

    pub fn route(&self, session: SessionId, packet: ClientPacket) {
        self.submit(HubEvent::Route { session, packet });
    }

    pub fn broadcast(&self, packet: ServerPacket) {
        self.submit(HubEvent::Broadcast(packet));
    }
}

pub struct Hub {
    ctx: Arc<GatewayContext>,
    sessions: HashMap<SessionId, SessionHandle>,
}

impl Hub {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self {
            ctx,
            sessions: HashMap::new(),
        }
    }

    /// Start the hub task. It runs until every handle is dropped.
    pub fn spawn(ctx: Arc<GatewayContext>) -> HubHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::new(ctx).run(rx));
        HubHandle { tx }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubEvent>) {
        info!("Hub started");
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        info!("Hub stopped with {} sessions registered", self.sessions.len());
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Distinct ids of users with at least one registered session.
    pub fn online_users(&self) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        self.sessions
            .values()
            .map(|s| s.user().id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub async fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(session) => self.register(session),
            HubEvent::Unregister(id) => self.unregister(id),
            HubEvent::Route { session, packet } => self.route(session, packet).await,
            HubEvent::Broadcast(packet) => {
                if let ServerPacket::UpdateUsers(users) = &packet {
                    self.refresh_users(users);
                }
                self.broadcast(&packet);
            }
        }
    }

    /// Encode once and queue to every session. A failed send only means
    /// that session is on its way out; the rest still get the frame.
    pub fn broadcast(&self, packet: &ServerPacket) -> usize {
        let text: Utf8Bytes = match packet.encode() {
            Ok(text) => text.into(),
            Err(e) => {
                warn!("Failed to encode {:?} broadcast: {}", packet.kind(), e);
                return 0;
            }
        };

        let mut delivered = 0;
        for session in self.sessions.values() {
            match session.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => debug!("Session {} not accepting frames, skipped", session.id()),
            }
        }
        delivered
    }

    fn register(&mut self, mut session: SessionHandle) {
        let user_id = session.user().id;
        session.user_mut().online = true;
        self.ctx
            .db_detached("mark user online", move |db| db.set_user_online(user_id, true));

        info!(
            "{} ({}) registered session {}",
            session.user().login,
            user_id,
            session.id()
        );
        self.sessions.insert(session.id(), session);
        self.broadcast(&policy::presence(user_id, true));
    }

    fn unregister(&mut self, id: SessionId) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        let user_id = session.user().id;
        info!("{} ({}) unregistered session {}", session.user().login, user_id, id);

        if self.sessions.values().any(|s| s.user().id == user_id) {
            return;
        }
        self.ctx
            .db_detached("mark user offline", move |db| db.set_user_online(user_id, false));
        self.broadcast(&policy::presence(user_id, false));
    }

    async fn route(&mut self, id: SessionId, packet: ClientPacket) {
        let Some(session) = self.sessions.get(&id) else {
            debug!("Packet from unregistered session {}, dropped", id);
            return;
        };
        let user_id = session.user().id;

        match packet {
            ClientPacket::OnlineUsers => {
                let reply = ServerPacket::OnlineUsers(self.online_users());
                if let Err(e) = session.send(&reply) {
                    debug!("Online users reply to {} failed: {}", id, e);
                }
            }
            ClientPacket::SendMessage(request) => self.send_message(user_id, request).await,
            ClientPacket::EditMessage(request) => self.edit_message(user_id, request).await,
            ClientPacket::DeleteMessage(message_id) => {
                self.delete_message(user_id, message_id).await
            }
            ClientPacket::SetChannel(channel_id) => self.set_channel(id, user_id, channel_id).await,
            ClientPacket::Typing(channel_id) => {
                if self.ctx.channel(channel_id).is_none() {
                    debug!("Typing in unknown channel {}, dropped", channel_id);
                    return;
                }
                trace!("{} typing in {}", user_id, channel_id);
                self.broadcast(&ServerPacket::Typing(channel_id, user_id));
            }
            other => warn!("Hub cannot route {:?}", other.kind()),
        }
    }

    async fn send_message(&self, author_id: Uuid, request: SendMessage) {
        let Some(channel) = self.ctx.channel(request.channel_id) else {
            warn!("Message for unknown channel {}, dropped", request.channel_id);
            return;
        };
        if !policy::valid_content(&request.content, self.ctx.settings.max_message_len) {
            debug!("Message from {} rejected by content limits", author_id);
            return;
        }

        // Storage keeps microseconds; the broadcast must match the stored row.
        let message = Message {
            id: Uuid::new_v4(),
            channel_id: channel.id,
            author_id,
            created_at: Utc::now().trunc_subsecs(6),
            edited_at: None,
            content: request.content,
        };

        if channel.save_messages {
            let row = message.clone();
            if let Err(e) = self.ctx.db(move |db| db.insert_message(&row)).await {
                warn!("Failed to persist message {}: {}", message.id, e);
                return;
            }
        }

        debug!("{} -> #{}: message {}", author_id, channel.name, message.id);
        self.broadcast(&ServerPacket::Message(message));
    }

    async fn edit_message(&self, author_id: Uuid, request: EditMessage) {
        if !policy::valid_content(&request.content, self.ctx.settings.max_message_len) {
            debug!("Edit from {} rejected by content limits", author_id);
            return;
        }

        let edited_at = Utc::now().trunc_subsecs(6);
        let message_id = request.message_id;
        let content = request.content.clone();
        let changed = self
            .ctx
            .db(move |db| db.edit_message(message_id, author_id, &content, edited_at))
            .await;

        match changed {
            Ok(0) => debug!("{} cannot edit message {}", author_id, message_id),
            Ok(_) => {
                self.broadcast(&ServerPacket::MessageEdited(MessageEdited {
                    message_id,
                    content: request.content,
                    edited_at,
                }));
            }
            Err(e) => warn!("Failed to edit message {}: {}", message_id, e),
        }
    }

    async fn delete_message(&self, author_id: Uuid, message_id: Uuid) {
        let changed = self
            .ctx
            .db(move |db| db.delete_message(message_id, author_id))
            .await;

        match changed {
            Ok(0) => debug!("{} cannot delete message {}", author_id, message_id),
            Ok(_) => {
                self.broadcast(&ServerPacket::MessageDeleted(message_id));
            }
            Err(e) => warn!("Failed to delete message {}: {}", message_id, e),
        }
    }

    async fn set_channel(&mut self, id: SessionId, user_id: Uuid, channel_id: Uuid) {
        if self.ctx.channel(channel_id).is_none() {
            warn!("{} selected unknown channel {}", user_id, channel_id);
            return;
        }
        if let Err(e) = self
            .ctx
            .db(move |db| db.set_user_channel(user_id, channel_id))
            .await
        {
            warn!("Failed to store channel for {}: {}", user_id, e);
            return;
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.user_mut().channel_id = Some(channel_id);
        }
    }

    fn refresh_users(&mut self, users: &[User]) {
        for session in self.sessions.values_mut() {
            let current = session.user_mut();
            if let Some(fresh) = users.iter().find(|u| u.id == current.id) {
                current.nickname = fresh.nickname.clone();
                current.bio = fresh.bio.clone();
                current.avatar_id = fresh.avatar_id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::extract::ws::Message as Frame;
    use chattin_db::Database;

    use crate::context::GatewaySettings;

    const GENERAL: Uuid = Uuid::from_u128(1);
    const TMP: Uuid = Uuid::from_u128(3);

    fn hub() -> Hub {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let channels = db.list_channels().unwrap();
        Hub::new(Arc::new(GatewayContext::new(
            db,
            channels,
            GatewaySettings::default(),
        )))
    }

    fn user(hub: &Hub, login: &str) -> User {
        let id = Uuid::new_v4();
        hub.ctx.db.create_user(id, login, "hash").unwrap();
        hub.ctx.db.get_user(id).unwrap().unwrap()
    }

    async fn join(hub: &mut Hub, user: &User) -> (SessionId, mpsc::UnboundedReceiver<Frame>) {
        let (session, rx) = SessionHandle::new(user.clone());
        let id = session.id();
        hub.handle(HubEvent::Register(session)).await;
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<ServerPacket> {
        let mut packets = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let Frame::Text(text) = frame else {
                panic!("unexpected frame {:?}", frame);
            };
            packets.push(ServerPacket::decode(text.as_str()).unwrap());
        }
        packets
    }

    fn send(channel_id: Uuid, content: &str) -> ClientPacket {
        ClientPacket::SendMessage(SendMessage {
            channel_id,
            content: content.into(),
        })
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let bob = user(&hub, "bob");
        let (a, _a_rx) = join(&mut hub, &alice).await;
        let (_b, mut b_rx) = join(&mut hub, &bob).await;
        assert_eq!(hub.session_count(), 2);
        drain(&mut b_rx);

        hub.handle(HubEvent::Unregister(a)).await;
        hub.handle(HubEvent::Unregister(a)).await;

        assert_eq!(hub.session_count(), 1);
        assert_eq!(drain(&mut b_rx), vec![ServerPacket::OfflineUsers(vec![alice.id])]);
    }

    #[tokio::test]
    async fn offline_waits_for_the_last_session() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let bob = user(&hub, "bob");
        let (tab1, _r1) = join(&mut hub, &alice).await;
        let (tab2, _r2) = join(&mut hub, &alice).await;
        let (_b, mut b_rx) = join(&mut hub, &bob).await;
        assert_eq!(hub.online_users().len(), 2);
        drain(&mut b_rx);

        hub.handle(HubEvent::Unregister(tab1)).await;
        assert!(drain(&mut b_rx).is_empty());
        assert!(hub.online_users().contains(&alice.id));

        hub.handle(HubEvent::Unregister(tab2)).await;
        assert_eq!(drain(&mut b_rx), vec![ServerPacket::OfflineUsers(vec![alice.id])]);
    }

    #[tokio::test]
    async fn broadcast_skips_dead_sessions() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let bob = user(&hub, "bob");
        let (_a, a_rx) = join(&mut hub, &alice).await;
        let (_b, mut b_rx) = join(&mut hub, &bob).await;
        drop(a_rx);
        drain(&mut b_rx);

        let delivered = hub.broadcast(&ServerPacket::MessageDeleted(Uuid::new_v4()));
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[tokio::test]
    async fn saved_channel_persists_what_it_broadcasts() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let (a, mut a_rx) = join(&mut hub, &alice).await;
        drain(&mut a_rx);

        hub.handle(HubEvent::Route {
            session: a,
            packet: send(GENERAL, "hello"),
        })
        .await;

        let packets = drain(&mut a_rx);
        let [ServerPacket::Message(sent)] = packets.as_slice() else {
            panic!("expected one message, got {:?}", packets);
        };
        let stored = hub.ctx.db.get_messages(GENERAL, None, 10).unwrap();
        assert_eq!(stored, vec![sent.clone()]);
    }

    #[tokio::test]
    async fn unsaved_channel_only_broadcasts() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let (a, mut a_rx) = join(&mut hub, &alice).await;
        drain(&mut a_rx);

        hub.handle(HubEvent::Route {
            session: a,
            packet: send(TMP, "ephemeral"),
        })
        .await;

        assert!(matches!(drain(&mut a_rx).as_slice(), [ServerPacket::Message(_)]));
        assert_eq!(hub.ctx.db.count_messages(TMP).unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_messages_are_dropped() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let (a, mut a_rx) = join(&mut hub, &alice).await;
        drain(&mut a_rx);

        for packet in [
            send(Uuid::new_v4(), "nowhere"),
            send(GENERAL, "   "),
            send(GENERAL, &"x".repeat(4001)),
        ] {
            hub.handle(HubEvent::Route { session: a, packet }).await;
        }

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(hub.ctx.db.count_messages(GENERAL).unwrap(), 0);
    }

    #[tokio::test]
    async fn only_the_author_can_edit_or_delete() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let bob = user(&hub, "bob");
        let (a, mut a_rx) = join(&mut hub, &alice).await;
        let (b, mut b_rx) = join(&mut hub, &bob).await;

        hub.handle(HubEvent::Route {
            session: a,
            packet: send(GENERAL, "original"),
        })
        .await;
        let message_id = hub.ctx.db.get_messages(GENERAL, None, 1).unwrap()[0].id;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let edit = |content: &str| {
            ClientPacket::EditMessage(EditMessage {
                message_id,
                content: content.into(),
            })
        };

        hub.handle(HubEvent::Route {
            session: b,
            packet: edit("hijacked"),
        })
        .await;
        hub.handle(HubEvent::Route {
            session: b,
            packet: ClientPacket::DeleteMessage(message_id),
        })
        .await;
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(
            hub.ctx.db.get_messages(GENERAL, None, 1).unwrap()[0].content,
            "original"
        );

        hub.handle(HubEvent::Route {
            session: a,
            packet: edit("fixed"),
        })
        .await;
        let packets = drain(&mut b_rx);
        let [ServerPacket::MessageEdited(edited)] = packets.as_slice() else {
            panic!("expected edit broadcast, got {:?}", packets);
        };
        assert_eq!(edited.content, "fixed");
        let stored = &hub.ctx.db.get_messages(GENERAL, None, 1).unwrap()[0];
        assert_eq!(stored.edited_at, Some(edited.edited_at));

        hub.handle(HubEvent::Route {
            session: a,
            packet: ClientPacket::DeleteMessage(message_id),
        })
        .await;
        assert_eq!(drain(&mut b_rx), vec![ServerPacket::MessageDeleted(message_id)]);
        assert_eq!(hub.ctx.db.count_messages(GENERAL).unwrap(), 0);
    }

    #[tokio::test]
    async fn typing_is_relayed_with_author() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let bob = user(&hub, "bob");
        let (a, _a_rx) = join(&mut hub, &alice).await;
        let (_b, mut b_rx) = join(&mut hub, &bob).await;
        drain(&mut b_rx);

        hub.handle(HubEvent::Route {
            session: a,
            packet: ClientPacket::Typing(GENERAL),
        })
        .await;
        hub.handle(HubEvent::Route {
            session: a,
            packet: ClientPacket::Typing(Uuid::new_v4()),
        })
        .await;

        assert_eq!(drain(&mut b_rx), vec![ServerPacket::Typing(GENERAL, alice.id)]);
    }

    #[tokio::test]
    async fn set_channel_is_remembered() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let (a, mut a_rx) = join(&mut hub, &alice).await;
        drain(&mut a_rx);

        hub.handle(HubEvent::Route {
            session: a,
            packet: ClientPacket::SetChannel(TMP),
        })
        .await;

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(hub.sessions[&a].user().channel_id, Some(TMP));
        let token_user = {
            hub.ctx.db.insert_token("t", alice.id).unwrap();
            hub.ctx.db.resolve_token("t").unwrap().unwrap()
        };
        assert_eq!(token_user.channel_id, Some(TMP));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn presence_writes_land_in_order() {
        let mut hub = hub();
        let users: Vec<User> = (0..300).map(|i| user(&hub, &format!("user{}", i))).collect();

        for user in &users {
            let (id, _rx) = join(&mut hub, user).await;
            hub.handle(HubEvent::Unregister(id)).await;
        }
        let (_back, _rx) = join(&mut hub, &users[0]).await;
        hub.ctx.flush_writes().await;

        let online: Vec<Uuid> = hub
            .ctx
            .db
            .list_users()
            .unwrap()
            .into_iter()
            .filter(|u| u.online)
            .map(|u| u.id)
            .collect();
        assert_eq!(online, vec![users[0].id]);
    }

    #[tokio::test]
    async fn new_users_reach_every_session() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let bob = user(&hub, "bob");
        let (_a, mut a_rx) = join(&mut hub, &alice).await;
        let (_b, mut b_rx) = join(&mut hub, &bob).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let carol = user(&hub, "carol");
        hub.handle(HubEvent::Broadcast(ServerPacket::AddUsers(vec![carol.clone()])))
            .await;

        let expected = vec![ServerPacket::AddUsers(vec![carol])];
        assert_eq!(drain(&mut a_rx), expected);
        assert_eq!(drain(&mut b_rx), expected);
    }

    #[tokio::test]
    async fn profile_updates_refresh_registered_users() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let bob = user(&hub, "bob");
        let (a, _a_rx) = join(&mut hub, &alice).await;
        let (b, mut b_rx) = join(&mut hub, &bob).await;
        drain(&mut b_rx);

        let avatar_id = Uuid::new_v4();
        let updated = User {
            nickname: "Al".into(),
            bio: "hello".into(),
            avatar_id: Some(avatar_id),
            ..alice.clone()
        };
        hub.handle(HubEvent::Broadcast(ServerPacket::UpdateUsers(vec![updated.clone()])))
            .await;

        assert_eq!(drain(&mut b_rx), vec![ServerPacket::UpdateUsers(vec![updated])]);
        let stored = hub.sessions[&a].user();
        assert_eq!(stored.nickname, "Al");
        assert_eq!(stored.bio, "hello");
        assert_eq!(stored.avatar_id, Some(avatar_id));
        assert!(stored.online);
        assert_eq!(hub.sessions[&b].user().nickname, bob.nickname);
    }

    #[tokio::test]
    async fn online_query_lists_each_user_once() {
        let mut hub = hub();
        let alice = user(&hub, "alice");
        let (a, mut a_rx) = join(&mut hub, &alice).await;
        let _second_tab = join(&mut hub, &alice).await;
        drain(&mut a_rx);

        hub.handle(HubEvent::Route {
            session: a,
            packet: ClientPacket::OnlineUsers,
        })
        .await;

        assert_eq!(drain(&mut a_rx), vec![ServerPacket::OnlineUsers(vec![alice.id])]);
    }
}
