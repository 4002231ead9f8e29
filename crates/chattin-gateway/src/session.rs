use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use chattin_types::models::User;
use chattin_types::packet::{AuthReply, ClientPacket, ServerPacket};

use crate::context::GatewayContext;
use crate::error::SessionError;
use crate::hub::HubHandle;
use crate::policy::{self, Admission, Dispatch, SessionState};

/// Consecutive unanswered pings before the connection is dropped.
const MAX_MISSED_PONGS: u8 = 2;

/// Opaque per-connection handle. A user with two tabs has two of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The hub's view of a live session: who it is and how to reach it.
///
/// Frames pushed through `send` are queued to the session's single writer
/// task, which owns the socket sink. Direct replies and broadcasts for the
/// same connection therefore never interleave on the wire.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    user: User,
    outbound: mpsc::UnboundedSender<Message>,
}

impl SessionHandle {
    pub fn new(user: User) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: SessionId::new(),
            user,
            outbound,
        };
        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub(crate) fn user_mut(&mut self) -> &mut User {
        &mut self.user
    }

    pub fn send(&self, packet: &ServerPacket) -> Result<(), SessionError> {
        let text = packet.encode()?;
        self.send_text(text.into())
    }

    /// Queue an already-encoded frame. Fails only once the writer is gone.
    pub fn send_text(&self, text: Utf8Bytes) -> Result<(), SessionError> {
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| SessionError::Closed)
    }
}

/// Unregisters from the hub when dropped, whichever way the session ends.
struct Registration {
    hub: HubHandle,
    session: SessionId,
}

impl Registration {
    fn new(hub: HubHandle, handle: SessionHandle) -> Self {
        let session = handle.id();
        hub.register(handle);
        Self { hub, session }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.unregister(self.session);
    }
}

/// Drive one upgraded connection from handshake to close.
///
/// The first frame must be an auth packet carrying a bearer token. On
/// success the session is registered with the hub and split into a reader
/// and a writer task; when either ends, the other is aborted and the
/// session unregisters exactly once.
pub async fn run<S, K, E>(stream: S, sink: K, hub: HubHandle, ctx: Arc<GatewayContext>)
where
    S: Stream<Item = Result<Message, E>> + Send + 'static,
    K: Sink<Message> + Send + 'static,
    K::Error: fmt::Display,
    E: fmt::Display + Send + 'static,
{
    let mut stream = Box::pin(stream);
    let mut sink = Box::pin(sink);

    debug!("Session upgraded, awaiting auth");
    let user = match handshake(&mut stream, &mut sink, &ctx).await {
        Ok(user) => user,
        Err(e) => {
            warn!("Session closed during handshake: {}", e);
            let _ = sink.close().await;
            return;
        }
    };

    let (handle, outbound) = SessionHandle::new(user);
    let login = handle.user().login.clone();
    let user_id = handle.user().id;
    info!("{} ({}) connected to gateway", login, user_id);

    let registration = Registration::new(hub.clone(), handle.clone());

    let pong_received = Arc::new(AtomicBool::new(true));
    let mut send_task = tokio::spawn(write_loop(
        sink,
        outbound,
        ctx.settings.heartbeat_interval,
        pong_received.clone(),
    ));
    let mut recv_task = tokio::spawn(read_loop(stream, handle, hub, ctx, pong_received));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    drop(registration);
    info!("{} ({}) disconnected from gateway", login, user_id);
}

async fn handshake<S, K, E>(
    stream: &mut S,
    sink: &mut K,
    ctx: &GatewayContext,
) -> Result<User, SessionError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
    E: fmt::Display,
{
    let timeout = ctx.settings.handshake_timeout;
    let text = tokio::time::timeout(timeout, next_text(stream))
        .await
        .map_err(|_| SessionError::HandshakeTimeout(timeout))??;

    let packet = ClientPacket::decode(&text)?;
    let token = match (policy::admit(SessionState::Authenticating, &packet), packet) {
        (Admission::Accept, ClientPacket::Auth(token)) => token,
        (_, packet) => {
            return Err(SessionError::Protocol(format!(
                "{:?} packet before auth",
                packet.kind()
            )));
        }
    };

    let user = match ctx.db(move |db| db.resolve_token(&token)).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            write(sink, &ServerPacket::Auth(None)).await?;
            return Err(SessionError::InvalidToken);
        }
        Err(e) => {
            write(sink, &ServerPacket::Auth(None)).await?;
            return Err(e.into());
        }
    };

    // Reply before registering so the auth answer precedes any broadcast.
    let reply = ServerPacket::Auth(Some(AuthReply {
        user_id: user.id,
        channel_id: user.channel_id,
    }));
    write(sink, &reply).await?;
    Ok(user)
}

/// Next text frame; control frames are skipped.
async fn next_text<S, E>(stream: &mut S) -> Result<Utf8Bytes, SessionError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(frame) = stream.next().await {
        match frame.map_err(|e| SessionError::Transport(e.to_string()))? {
            Message::Text(text) => return Ok(text),
            Message::Binary(_) => {
                return Err(SessionError::Protocol("binary frame before auth".into()));
            }
            Message::Close(_) => return Err(SessionError::Closed),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Err(SessionError::Closed)
}

async fn write<K>(sink: &mut K, packet: &ServerPacket) -> Result<(), SessionError>
where
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
{
    let text = packet.encode()?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))
}

async fn read_loop<S, E>(
    mut stream: S,
    session: SessionHandle,
    hub: HubHandle,
    ctx: Arc<GatewayContext>,
    pong_received: Arc<AtomicBool>,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let user = session.user();
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{} ({}) read error: {}", user.login, user.id, e);
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                if let Err(e) = handle_text(&session, &hub, &ctx, text.as_str()).await {
                    debug!("{} ({}) session ending: {}", user.login, user.id, e);
                    break;
                }
            }
            Message::Pong(_) => pong_received.store(true, Ordering::Release),
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) => {}
        }
    }
}

/// Errors returned here end the session.
async fn handle_text(
    session: &SessionHandle,
    hub: &HubHandle,
    ctx: &GatewayContext,
    text: &str,
) -> Result<(), SessionError> {
    let user = session.user();
    let packet = match ClientPacket::decode(text) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(
                "{} ({}) bad packet: {} -- raw: {}",
                user.login,
                user.id,
                e,
                preview(text)
            );
            return Ok(());
        }
    };

    match policy::admit(SessionState::Active, &packet) {
        Admission::Accept => {}
        Admission::Drop => {
            warn!(
                "{} ({}) unexpected packet {:?}, dropped",
                user.login,
                user.id,
                packet.kind()
            );
            return Ok(());
        }
        Admission::Close => {
            return Err(SessionError::Protocol(format!("{:?} while active", packet.kind())));
        }
    }

    if matches!(packet, ClientPacket::Typing(_)) {
        trace!("{} ({}) typing", user.login, user.id);
    } else {
        debug!("{} ({}) -> {:?}", user.login, user.id, packet.kind());
    }

    match policy::dispatch(&packet) {
        Dispatch::Hub => {
            hub.route(session.id(), packet);
            Ok(())
        }
        Dispatch::Direct => answer_query(session, ctx, packet).await,
    }
}

/// Read-only queries never touch the registry, so they skip the hub queue.
/// Storage failures are logged and the query goes unanswered.
async fn answer_query(
    session: &SessionHandle,
    ctx: &GatewayContext,
    packet: ClientPacket,
) -> Result<(), SessionError> {
    let reply = match packet {
        ClientPacket::ChannelList => ServerPacket::ChannelList(ctx.channels.clone()),
        ClientPacket::UserList => match ctx.db(|db| db.list_users()).await {
            Ok(users) => ServerPacket::UserList(users),
            Err(e) => {
                warn!("{} user list failed: {}", session.user().login, e);
                return Ok(());
            }
        },
        ClientPacket::GetMessages(query) => {
            let limit = policy::page_size(query.count, ctx.settings.max_page_size);
            let result = ctx
                .db(move |db| db.get_messages(query.channel_id, query.from_message_id, limit))
                .await;
            match result {
                Ok(messages) => ServerPacket::Messages(messages),
                Err(e) => {
                    warn!("{} message history failed: {}", session.user().login, e);
                    return Ok(());
                }
            }
        }
        other => {
            warn!("{:?} is not a direct query", other.kind());
            return Ok(());
        }
    };
    session.send(&reply)
}

async fn write_loop<K>(
    mut sink: K,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    heartbeat_interval: Duration,
    pong_received: Arc<AtomicBool>,
) where
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
{
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    debug!("Write failed: {}", e);
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= MAX_MISSED_PONGS {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
