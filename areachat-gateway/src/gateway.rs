//! Gateway core: shared state, the channel WebSocket handler and area
//! fan-out.
//!
//! A socket binds to one area with its first `auth` frame. After that the
//! gateway pushes every `message:*` event of the area to it, relays typing
//! frames from other members, and answers `ping` with `pong`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use areachat_proto::event::InboundEvent;
use areachat_proto::frame::{
    self, AuthErrorCode, ClientFrame, ControlFrame, MAX_FRAME_SIZE, ServerFrame,
};
use areachat_proto::message::AreaRef;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::config::{GatewayConfig, UserEntry};
use crate::store::AreaHistory;

struct Subscriber {
    user_id: String,
    tx: mpsc::UnboundedSender<Message>,
}

/// Shared gateway state: accepted users, known areas, history and the
/// sockets subscribed to each area.
pub struct GatewayState {
    users: HashMap<String, UserEntry>,
    areas: HashSet<AreaRef>,
    history_limit_max: usize,
    assistant_reply: String,
    /// Message history of every area.
    pub history: AreaHistory,
    subscribers: RwLock<HashMap<AreaRef, HashMap<u64, Subscriber>>>,
    next_subscriber: AtomicU64,
}

/// An authenticated channel subscription.
#[derive(Debug, Clone)]
pub struct Session {
    /// Server-side session id sent in `auth:ok`.
    pub id: String,
    /// The authenticated user.
    pub user: UserEntry,
    /// The subscribed area.
    pub area: AreaRef,
}

impl GatewayState {
    /// Creates a state accepting `users`. An empty `areas` list opens every
    /// area.
    #[must_use]
    pub fn new(users: Vec<UserEntry>, areas: Vec<AreaRef>) -> Self {
        let defaults = GatewayConfig::default();
        Self {
            users: users.into_iter().map(|u| (u.token.clone(), u)).collect(),
            areas: areas.into_iter().collect(),
            history_limit_max: defaults.history_limit_max,
            assistant_reply: defaults.assistant_reply,
            history: AreaHistory::new(),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Creates a state from resolved configuration.
    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            history_limit_max: config.history_limit_max,
            assistant_reply: config.assistant_reply.clone(),
            ..Self::new(config.users.clone(), config.areas.clone())
        }
    }

    /// Largest history page the REST API returns.
    #[must_use]
    pub const fn history_limit_max(&self) -> usize {
        self.history_limit_max
    }

    /// Canned assistant answer.
    #[must_use]
    pub fn assistant_reply(&self) -> &str {
        &self.assistant_reply
    }

    /// The user holding `token`, if any.
    #[must_use]
    pub fn authenticate(&self, token: &str) -> Option<&UserEntry> {
        self.users.get(token)
    }

    /// Whether the area exists.
    #[must_use]
    pub fn area_exists(&self, area: &AreaRef) -> bool {
        self.areas.is_empty() || self.areas.contains(area)
    }

    /// Validates an `auth` frame.
    ///
    /// # Errors
    ///
    /// Returns the refusal code and reason to send back in `auth:error`.
    pub fn admit(
        &self,
        token: &str,
        area: AreaRef,
        user_id: &str,
    ) -> Result<Session, (AuthErrorCode, String)> {
        let user = self
            .authenticate(token)
            .ok_or((AuthErrorCode::Unauthorized, "unknown token".to_string()))?;
        if user.id != user_id {
            return Err((
                AuthErrorCode::Forbidden,
                "token does not belong to this user".to_string(),
            ));
        }
        if !self.area_exists(&area) {
            return Err((AuthErrorCode::AreaNotFound, format!("no area {area}")));
        }
        Ok(Session {
            id: Uuid::now_v7().to_string(),
            user: user.clone(),
            area,
        })
    }

    /// Subscribes a socket writer to an area; returns its subscriber key.
    pub async fn subscribe(
        &self,
        area: &AreaRef,
        user_id: &str,
        tx: mpsc::UnboundedSender<Message>,
    ) -> u64 {
        let key = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.write().await;
        subs.entry(area.clone()).or_default().insert(
            key,
            Subscriber {
                user_id: user_id.to_string(),
                tx,
            },
        );
        key
    }

    /// Removes a subscriber.
    pub async fn unsubscribe(&self, area: &AreaRef, key: u64) {
        let mut subs = self.subscribers.write().await;
        if let Some(area_subs) = subs.get_mut(area) {
            area_subs.remove(&key);
            if area_subs.is_empty() {
                subs.remove(area);
            }
        }
    }

    /// Number of sockets subscribed to an area.
    pub async fn subscriber_count(&self, area: &AreaRef) -> usize {
        self.subscribers.read().await.get(area).map_or(0, HashMap::len)
    }

    /// Pushes an event to every socket of the area except `skip`.
    /// Returns how many sockets it was queued for.
    pub async fn broadcast(&self, area: &AreaRef, event: InboundEvent, skip: Option<u64>) -> usize {
        let tag = event.tag();
        let text = match frame::encode_server(&ServerFrame::from(event)) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(area = %area, error = %e, "failed to encode event");
                return 0;
            }
        };

        let subs = self.subscribers.read().await;
        let Some(area_subs) = subs.get(area) else {
            return 0;
        };
        let mut delivered = 0;
        for (key, sub) in area_subs {
            if Some(*key) == skip {
                continue;
            }
            if sub.tx.send(Message::Text(text.clone().into())).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(area = %area, user_id = %sub.user_id, "subscriber writer gone");
            }
        }
        drop(subs);
        tracing::debug!(area = %area, event = tag, delivered, "broadcast");
        delivered
    }
}

/// Handles one channel socket from handshake to disconnect.
pub async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some((token, area, user_id)) = wait_for_auth(&mut ws_receiver).await else {
        tracing::warn!("connection closed before auth");
        return;
    };

    let session = match state.admit(&token, area, &user_id) {
        Ok(session) => session,
        Err((code, reason)) => {
            tracing::info!(user_id = %user_id, code = %code, reason = %reason, "auth refused");
            let refusal = ControlFrame::AuthError { code, reason };
            let _ = send_frame(&mut ws_sender, refusal.into()).await;
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let ack = ControlFrame::AuthOk {
        session_id: Some(session.id.clone()),
    };
    if let Err(e) = send_frame(&mut ws_sender, ack.into()).await {
        tracing::warn!(session = %session.id, error = %e, "failed to send auth:ok");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let key = state.subscribe(&session.area, &session.user.id, tx.clone()).await;
    tracing::info!(
        session = %session.id,
        user_id = %session.user.id,
        area = %session.area,
        "channel subscribed"
    );

    let writer_session = session.id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(session = %writer_session, "WebSocket write failed");
                break;
            }
        }
    });

    let typing = Arc::new(AtomicBool::new(false));
    let reader_state = Arc::clone(&state);
    let reader_session = session.clone();
    let reader_typing = Arc::clone(&typing);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_client_text(
                        &reader_session,
                        key,
                        text.as_str(),
                        &tx,
                        &reader_typing,
                        &reader_state,
                    )
                    .await;
                }
                Message::Close(_) => {
                    tracing::info!(session = %reader_session.id, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unsubscribe(&session.area, key).await;
    if typing.load(Ordering::Acquire) {
        let stop = InboundEvent::TypingStopped {
            user_id: Some(session.user.id.clone()),
        };
        state.broadcast(&session.area, stop, Some(key)).await;
    }
    tracing::info!(session = %session.id, "channel unsubscribed");
}

async fn wait_for_auth(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<(String, AreaRef, String)> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match frame::decode_client(text.as_str()) {
                Ok(ClientFrame::Auth {
                    token,
                    team_id,
                    area_id,
                    user_id,
                }) => return Some((token, AreaRef::new(team_id, area_id), user_id)),
                Ok(other) => {
                    tracing::warn!(frame = ?other, "expected auth, got a different frame");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode auth frame");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn handle_client_text(
    session: &Session,
    key: u64,
    text: &str,
    own: &mpsc::UnboundedSender<Message>,
    typing: &AtomicBool,
    state: &GatewayState,
) {
    if text.len() > MAX_FRAME_SIZE {
        tracing::warn!(session = %session.id, size = text.len(), "oversized frame dropped");
        return;
    }
    let parsed = match frame::decode_client(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(session = %session.id, error = %e, "failed to decode client frame");
            return;
        }
    };

    match parsed {
        ClientFrame::Ping => {
            if let Ok(pong) = frame::encode_server(&ControlFrame::Pong.into()) {
                let _ = own.send(Message::Text(pong.into()));
            }
        }
        ClientFrame::Typing { is_typing } => {
            typing.store(is_typing, Ordering::Release);
            let event = if is_typing {
                InboundEvent::TypingStarted {
                    user_id: Some(session.user.id.clone()),
                    user_name: Some(session.user.name.clone()),
                }
            } else {
                InboundEvent::TypingStopped {
                    user_id: Some(session.user.id.clone()),
                }
            };
            state.broadcast(&session.area, event, Some(key)).await;
        }
        ClientFrame::Auth { .. } => {
            tracing::warn!(session = %session.id, "duplicate auth on a subscribed channel");
        }
    }
}

async fn send_frame(
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    reply: ServerFrame,
) -> Result<(), String> {
    let text = frame::encode_server(&reply).map_err(|e| e.to_string())?;
    sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Starts the gateway with an empty state that accepts no users.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(GatewayState::new(Vec::new(), Vec::new()))).await
}

/// Starts the gateway with a pre-configured [`GatewayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<GatewayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .merge(crate::api::routes())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "gateway server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<GatewayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
