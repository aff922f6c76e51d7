//! Area conversation context: everything one chat view needs.
//!
//! [`AreaConversation`] owns the message store, the typing tracker, the
//! delivery outbox, the connection handle and the pagination controller for
//! one (team, area) pair. It is not shared between views. Two background
//! tasks run while it is open:
//!
//! - the **pump**, which applies channel events to the store in arrival order;
//! - the **typing ticker**, which prunes expired typing entries and emits the
//!   local stop signal after an idle window.
//!
//! Both stop, together with the connection supervisor and any in-flight page
//! load, when the conversation is closed or dropped. Every async continuation
//! re-checks liveness before touching state, so nothing mutates a closed
//! conversation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use areachat_proto::api::{AssistantQuestion, SendMessageRequest};
use areachat_proto::event::InboundEvent;
use areachat_proto::frame::ClientFrame;
use areachat_proto::message::{
    AreaRef, Author, Message, MessageId, MessageKind, Provenance, Timestamp, UserId,
};

use crate::backend::{Assistant, BackendError, ChatBackend};
use crate::chat::delivery::{
    DeleteError, DeleteState, Outbox, Outgoing, SendError, SendOutcome, SendState,
    classify_input,
};
use crate::chat::pagination::{PageOutcome, PageSink, PaginationController, PaginationError};
use crate::chat::reconcile::{Reconciled, apply_message, normalize, reconcile};
use crate::chat::store::{MessageStore, StoredMessage};
use crate::chat::typing::{TypingDebouncer, TypingSignal, TypingTracker};
use crate::config::{ChatConfig, ClientConfig, ReconnectConfig, TypingConfig};
use crate::connection::{
    ChannelEvent, ConnectError, ConnectionHandle, ConnectionManager, ConnectionState,
    Credentials, FrameSender,
};
use crate::transport::Connector;

/// The local user as the chat view knows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Stable user id from the session provider.
    pub user_id: UserId,
    /// Name shown on optimistic sends.
    pub display_name: String,
}

/// Which area to open, as whom.
#[derive(Debug, Clone)]
pub struct AreaTarget {
    /// Team and area.
    pub area: AreaRef,
    /// The local user.
    pub user: Participant,
    /// Bearer credential; absence is a fatal connect error.
    pub token: Option<String>,
}

/// Settings for one conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationConfig {
    /// Pagination, delivery and assistant settings.
    pub chat: ChatConfig,
    /// Channel lifecycle.
    pub reconnect: ReconnectConfig,
    /// Typing indicator timing.
    pub typing: TypingConfig,
}

impl From<&ClientConfig> for ConversationConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            chat: config.chat.clone(),
            reconnect: config.reconnect.clone(),
            typing: config.typing.clone(),
        }
    }
}

/// Notifications for the chat view. Each one means "re-read this part".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// `ordered()` changed.
    MessagesChanged,
    /// The set of typing users changed.
    TypingChanged(Vec<String>),
    /// The connection state changed.
    ConnectionChanged(ConnectionState),
    /// Re-authentication was refused; the view should leave the area.
    ConnectionLost(String),
}

/// Errors opening a conversation.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    /// The channel could not be established (bad credential, unknown area).
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

struct ConversationState {
    store: MessageStore,
    typing: TypingTracker,
    outbox: Outbox,
    debouncer: TypingDebouncer,
}

/// State shared between the conversation, its tasks and the pager.
struct Shared {
    state: Mutex<ConversationState>,
    events: mpsc::Sender<ConversationEvent>,
    alive: AtomicBool,
    lost: Mutex<Option<String>>,
}

impl Shared {
    fn new(user: &UserId, typing: &TypingConfig, events: mpsc::Sender<ConversationEvent>) -> Self {
        Self {
            state: Mutex::new(ConversationState {
                store: MessageStore::new(),
                typing: TypingTracker::new(user.clone(), typing.window),
                outbox: Outbox::new(),
                debouncer: TypingDebouncer::new(typing.window),
            }),
            events,
            alive: AtomicBool::new(true),
            lost: Mutex::new(None),
        }
    }

    fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Notify the view without waiting. A full buffer drops the event; the
    /// view can always re-read state.
    fn emit(&self, event: ConversationEvent) {
        if !self.alive() {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::warn!(?event, "view event buffer full, notification dropped");
        }
    }

    /// Record a refused reconnect and deliver the notice, waiting for buffer
    /// space instead of dropping it.
    async fn emit_lost(&self, reason: String) {
        *self.lost.lock() = Some(reason.clone());
        if self.alive() {
            let _ = self.events.send(ConversationEvent::ConnectionLost(reason)).await;
        }
    }

    /// Apply one channel event. Returns nothing; views are notified.
    fn apply_inbound(&self, event: InboundEvent) {
        let tag = event.tag();
        let now = Instant::now();
        let mut notify = Vec::new();
        {
            let mut state = self.state.lock();
            match reconcile(event, Timestamp::now()) {
                Reconciled::Message(message) => {
                    if insert_confirmed(&mut state, message) {
                        notify.push(ConversationEvent::MessagesChanged);
                    }
                }
                Reconciled::Deleted(id) => {
                    if state.outbox.delete_state(&id) == Some(DeleteState::Requested) {
                        state.outbox.confirm_delete(&id);
                    }
                    if state.store.remove(&id).is_some() {
                        notify.push(ConversationEvent::MessagesChanged);
                    }
                }
                Reconciled::Edited { id, edited_at } => {
                    if state.store.mark_edited(&id, edited_at) {
                        notify.push(ConversationEvent::MessagesChanged);
                    }
                }
                Reconciled::TypingStarted {
                    user_id,
                    display_name,
                } => {
                    if state.typing.mark_typing(user_id, display_name, now) {
                        notify.push(ConversationEvent::TypingChanged(
                            state.typing.display_names(now),
                        ));
                    }
                }
                Reconciled::TypingStopped(user_id) => {
                    if state.typing.mark_stopped(&user_id) {
                        notify.push(ConversationEvent::TypingChanged(
                            state.typing.display_names(now),
                        ));
                    }
                }
                Reconciled::Ignored => tracing::trace!(tag, "inbound event ignored"),
            }
        }
        for event in notify {
            self.emit(event);
        }
    }

    fn clear_typing(&self) {
        let cleared = self.state.lock().typing.clear();
        if cleared {
            self.emit(ConversationEvent::TypingChanged(Vec::new()));
        }
    }
}

/// Insert a confirmed message, settling the matching pending send if the
/// server echoed its nonce.
fn insert_confirmed(state: &mut ConversationState, message: Message) -> bool {
    if let Some(nonce) = &message.client_nonce {
        let local_id = MessageId::new(nonce.clone());
        if state.store.get(&local_id).is_some_and(StoredMessage::is_pending) {
            state.outbox.confirm_send(&local_id, message.id.clone());
        }
    }
    apply_message(&mut state.store, message)
}

impl PageSink for Shared {
    fn is_alive(&self) -> bool {
        self.alive()
    }

    fn has_more(&self) -> bool {
        self.state.lock().store.has_more()
    }

    fn merge_older(&self, messages: Vec<Message>, has_more: bool) -> usize {
        let inserted = self.state.lock().store.prepend_page(messages, has_more);
        if inserted > 0 {
            self.emit(ConversationEvent::MessagesChanged);
        }
        inserted
    }

    fn merge_latest(&self, messages: Vec<Message>) -> (usize, bool) {
        let (inserted, overlapped) = {
            let mut state = self.state.lock();
            let overlapped = !state.store.has_confirmed()
                || messages.iter().any(|m| state.store.contains(&m.id));
            let mut inserted = 0;
            for message in messages {
                if insert_confirmed(&mut state, message) {
                    inserted += 1;
                }
            }
            (inserted, overlapped)
        };
        if inserted > 0 {
            self.emit(ConversationEvent::MessagesChanged);
        }
        (inserted, overlapped)
    }
}

/// One open area chat.
pub struct AreaConversation<B: ChatBackend + Assistant> {
    target: AreaTarget,
    chat: ChatConfig,
    shared: Arc<Shared>,
    backend: Arc<B>,
    pagination: PaginationController<B, Shared>,
    connection: ConnectionHandle,
    outbound: FrameSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: ChatBackend + Assistant> AreaConversation<B> {
    /// Connect to the area, start the background tasks and load the newest
    /// page of history.
    ///
    /// A failed initial history load is logged and left for the view to
    /// retry through [`load_older`](Self::load_older).
    ///
    /// # Errors
    ///
    /// [`ConversationError::Connect`] if the credential is missing or the
    /// handshake is rejected.
    pub async fn open<C: Connector>(
        target: AreaTarget,
        connector: C,
        backend: B,
        config: ConversationConfig,
    ) -> Result<(Self, mpsc::Receiver<ConversationEvent>), ConversationError> {
        let buffer = config.chat.event_buffer.max(1);
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let shared = Arc::new(Shared::new(&target.user.user_id, &config.typing, event_tx));
        let backend = Arc::new(backend);
        let pagination = PaginationController::new(
            Arc::clone(&backend),
            Arc::clone(&shared),
            target.area.clone(),
            config.chat.page_size,
            config.chat.max_recovery_pages,
        );

        let credentials = Credentials {
            area: target.area.clone(),
            user_id: target.user.user_id.clone(),
            token: target.token.clone(),
        };
        let manager = ConnectionManager::new(connector, config.reconnect.clone());
        let (connection, channel_events) = manager.connect(credentials, buffer).await?;
        let outbound = connection.sender();

        let pump = tokio::spawn(run_pump(
            Arc::clone(&shared),
            pagination.clone(),
            channel_events,
        ));
        let ticker = tokio::spawn(run_typing_ticker(
            Arc::clone(&shared),
            outbound.clone(),
            config.typing.tick,
        ));

        tracing::info!(area = %target.area, user = %target.user.user_id, "conversation opened");
        let conversation = Self {
            target,
            chat: config.chat,
            shared,
            backend,
            pagination,
            connection,
            outbound,
            tasks: Mutex::new(vec![pump, ticker]),
        };

        if let Err(e) = conversation.pagination.load_older(None).await {
            tracing::warn!(area = %conversation.target.area, err = %e, "initial history load failed");
        }
        Ok((conversation, event_rx))
    }

    /// The area this conversation is scoped to.
    #[must_use]
    pub const fn area(&self) -> &AreaRef {
        &self.target.area
    }

    /// The local user.
    #[must_use]
    pub const fn participant(&self) -> &Participant {
        &self.target.user
    }

    /// Messages in chronological order, pending sends included.
    #[must_use]
    pub fn ordered(&self) -> Vec<StoredMessage> {
        self.shared.state.lock().store.ordered().to_vec()
    }

    /// Whether a date separator belongs above entry `index` of [`ordered`](Self::ordered).
    #[must_use]
    pub fn starts_new_day(&self, index: usize) -> bool {
        self.shared.state.lock().store.starts_new_day(index)
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Why the server ended the session, once re-authentication was refused.
    ///
    /// Stays set after the matching [`ConversationEvent::ConnectionLost`].
    #[must_use]
    pub fn connection_lost(&self) -> Option<String> {
        self.shared.lost.lock().clone()
    }

    /// Whether the view should offer sending.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.shared.alive() && self.connection.is_connected()
    }

    /// Names of remote users typing right now, sorted.
    #[must_use]
    pub fn typing_display_names(&self) -> Vec<String> {
        self.shared.state.lock().typing.display_names(Instant::now())
    }

    /// Whether older history may still exist.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.shared.state.lock().store.has_more()
    }

    /// State of a send, keyed by the local id of its pending entry.
    #[must_use]
    pub fn send_state(&self, local_id: &MessageId) -> SendState {
        self.shared.state.lock().outbox.send_state(local_id)
    }

    /// Local ids of failed sends that can be retried.
    #[must_use]
    pub fn failed_sends(&self) -> Vec<MessageId> {
        self.shared.state.lock().outbox.failed_sends()
    }

    /// State of a delete, if one was requested.
    #[must_use]
    pub fn delete_state(&self, id: &MessageId) -> Option<DeleteState> {
        self.shared.state.lock().outbox.delete_state(id)
    }

    /// Send a line of user input.
    ///
    /// Plain text is shown immediately as a pending entry, then replaced by
    /// the confirmed message or rolled back. Input starting with the
    /// assistant prefix goes to the assistant instead and never enters the
    /// store.
    ///
    /// # Errors
    ///
    /// [`SendError`] for local validation failures (nothing sent), backend
    /// failures and timeouts (pending entry removed, retry available).
    pub async fn send(&self, text: &str) -> Result<SendOutcome, SendError> {
        if !self.shared.alive() {
            return Err(SendError::Closed);
        }
        match classify_input(text, &self.chat.assistant_prefix)? {
            Outgoing::Message(body) => self.dispatch(body).await,
            Outgoing::Assistant(question) => self.ask(question).await,
        }
    }

    /// Re-dispatch a failed send as a fresh pending send.
    ///
    /// # Errors
    ///
    /// [`SendError::NotRetryable`] unless `local_id` names a failed send,
    /// otherwise as [`send`](Self::send).
    pub async fn retry_send(&self, local_id: &MessageId) -> Result<SendOutcome, SendError> {
        if !self.shared.alive() {
            return Err(SendError::Closed);
        }
        let body = self.shared.state.lock().outbox.take_failed(local_id)?;
        tracing::debug!(%local_id, "retrying failed send");
        self.dispatch(body).await
    }

    /// Delete one of the local user's messages.
    ///
    /// The entry stays until the server confirms. A backend "not found"
    /// counts as success because the message is gone either way.
    ///
    /// # Errors
    ///
    /// [`DeleteError`] if the message is unknown, still pending, already
    /// being deleted, or the backend refuses or times out.
    pub async fn delete(&self, id: &MessageId) -> Result<(), DeleteError> {
        if !self.shared.alive() {
            return Err(DeleteError::Closed);
        }
        {
            let mut state = self.shared.state.lock();
            match state.store.get(id) {
                None => return Err(DeleteError::NotFound),
                Some(entry) if entry.is_pending() => return Err(DeleteError::Pending),
                Some(_) => {}
            }
            state.outbox.begin_delete(id.clone())?;
        }

        let result = tokio::time::timeout(
            self.chat.delete_timeout,
            self.backend.delete_message(&self.target.area, id),
        )
        .await;
        if !self.shared.alive() {
            return Err(DeleteError::Closed);
        }

        let failure = match result {
            Ok(Ok(()) | Err(BackendError::NotFound)) => None,
            Ok(Err(e)) => Some(DeleteError::Backend(e)),
            Err(_) => Some(DeleteError::Timeout),
        };

        let removed = {
            let mut state = self.shared.state.lock();
            if let Some(err) = &failure {
                state.outbox.fail_delete(id, err.to_string());
                false
            } else {
                state.outbox.confirm_delete(id);
                state.store.remove(id).is_some()
            }
        };
        if removed {
            self.shared.emit(ConversationEvent::MessagesChanged);
        }

        match failure {
            Some(err) => {
                tracing::warn!(%id, err = %err, "delete failed");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Load the page before the oldest confirmed message (or the newest page
    /// if nothing is loaded yet).
    ///
    /// # Errors
    ///
    /// [`PaginationError`] on backend failure; loaded messages are untouched.
    pub async fn load_older(&self) -> Result<PageOutcome, PaginationError> {
        let boundary = self
            .shared
            .state
            .lock()
            .store
            .oldest_confirmed_id()
            .cloned();
        self.pagination.load_older(boundary).await
    }

    /// The local user pressed a key in the composer.
    pub fn mark_typing(&self) {
        let signal = self.shared.state.lock().debouncer.on_input(Instant::now());
        if let Some(signal) = signal {
            send_typing(&self.outbound, signal);
        }
    }

    /// The local user left the composer.
    pub fn mark_stopped(&self) {
        let signal = self.shared.state.lock().debouncer.stop();
        if let Some(signal) = signal {
            send_typing(&self.outbound, signal);
        }
    }

    /// Tear down: cancel page loads and catch-up, stop the tasks and close
    /// the channel. Idempotent.
    pub fn close(&self) {
        if !self.shared.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.pagination.cancel_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.connection.disconnect();
        tracing::info!(area = %self.target.area, "conversation closed");
    }

    async fn dispatch(&self, body: String) -> Result<SendOutcome, SendError> {
        let local_id = MessageId::local();
        let pending = Message {
            id: local_id.clone(),
            author: Author {
                user_id: Some(self.target.user.user_id.clone()),
                display_name: self.target.user.display_name.clone(),
                avatar_url: None,
            },
            body: body.clone(),
            kind: MessageKind::Text,
            created_at: Timestamp::now(),
            edited_at: None,
            provenance: Provenance::Web,
            telegram: None,
            client_nonce: Some(local_id.to_string()),
            timestamp_estimated: false,
        };

        let stop = {
            let mut state = self.shared.state.lock();
            state.store.append_pending(pending);
            state.outbox.begin_send(local_id.clone(), body.clone());
            state.debouncer.stop()
        };
        self.shared.emit(ConversationEvent::MessagesChanged);
        if let Some(signal) = stop {
            send_typing(&self.outbound, signal);
        }

        let request = SendMessageRequest {
            content: body,
            kind: MessageKind::Text.as_tag().to_string(),
            client_nonce: Some(local_id.to_string()),
        };
        let result = tokio::time::timeout(
            self.chat.send_timeout,
            self.backend.send_message(&self.target.area, &request),
        )
        .await;
        if !self.shared.alive() {
            return Err(SendError::Closed);
        }

        let raw = match result {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return self.roll_back(&local_id, SendError::Backend(e)),
            Err(_) => return self.roll_back(&local_id, SendError::Timeout),
        };
        let Some(confirmed) = normalize(&raw, Timestamp::now()) else {
            let err = BackendError::Decode("confirmed message has no id".into());
            return self.roll_back(&local_id, SendError::Backend(err));
        };

        let server_id = confirmed.id.clone();
        {
            let mut state = self.shared.state.lock();
            state.outbox.confirm_send(&local_id, server_id.clone());
            state.store.replace_pending(&local_id, confirmed);
        }
        self.shared.emit(ConversationEvent::MessagesChanged);
        tracing::debug!(%local_id, %server_id, "send confirmed");
        Ok(SendOutcome::Sent(server_id))
    }

    /// Remove the pending entry after a failed send, unless the live echo
    /// already confirmed it.
    fn roll_back(&self, local_id: &MessageId, err: SendError) -> Result<SendOutcome, SendError> {
        let outcome = {
            let mut state = self.shared.state.lock();
            if state.outbox.fail_send(local_id, err.to_string()) {
                state.store.remove(local_id);
                None
            } else {
                match state.outbox.send_state(local_id) {
                    SendState::Confirmed(server_id) => Some(server_id),
                    _ => None,
                }
            }
        };
        if let Some(server_id) = outcome {
            tracing::debug!(%local_id, %server_id, "send failed after live echo, keeping confirmed copy");
            return Ok(SendOutcome::Sent(server_id));
        }
        tracing::warn!(%local_id, err = %err, "send failed, rolled back");
        self.shared.emit(ConversationEvent::MessagesChanged);
        Err(err)
    }

    async fn ask(&self, question: String) -> Result<SendOutcome, SendError> {
        self.mark_stopped();
        let request = AssistantQuestion {
            question,
            team_id: self.target.area.team_id.to_string(),
            area_id: self.target.area.area_id.to_string(),
        };
        match tokio::time::timeout(self.chat.send_timeout, self.backend.ask(&request)).await {
            Ok(Ok(answer)) => Ok(SendOutcome::Answered(answer)),
            Ok(Err(e)) => Err(SendError::Backend(e)),
            Err(_) => Err(SendError::Timeout),
        }
    }
}

impl<B: ChatBackend + Assistant> Drop for AreaConversation<B> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Apply channel events in arrival order until the channel ends or the
/// conversation closes.
async fn run_pump<B: ChatBackend>(
    shared: Arc<Shared>,
    pagination: PaginationController<B, Shared>,
    mut events: mpsc::Receiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        if !shared.alive() {
            break;
        }
        match event {
            ChannelEvent::Inbound(inbound) => shared.apply_inbound(inbound),
            ChannelEvent::StateChanged(state) => {
                if state != ConnectionState::Connected {
                    shared.clear_typing();
                }
                shared.emit(ConversationEvent::ConnectionChanged(state));
            }
            ChannelEvent::Reconnected { attempts } => {
                tracing::info!(attempts, "reconnected, catching up on missed messages");
                let pagination = pagination.clone();
                tokio::spawn(async move {
                    match pagination.catch_up().await {
                        Ok(result) if result.possible_gap => {
                            tracing::warn!(inserted = result.inserted, "catch-up incomplete");
                        }
                        Ok(result) => tracing::debug!(inserted = result.inserted, "catch-up done"),
                        Err(PaginationError::Closed) => {}
                        Err(e) => tracing::warn!(err = %e, "catch-up failed"),
                    }
                });
            }
            ChannelEvent::Fatal(e) => {
                shared.clear_typing();
                shared.emit_lost(e.to_string()).await;
            }
        }
    }
    tracing::debug!("conversation pump exiting");
}

/// Prune expired typing entries and end idle local typing.
async fn run_typing_ticker(shared: Arc<Shared>, outbound: FrameSender, tick: Duration) {
    let mut interval = tokio::time::interval(tick.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if !shared.alive() {
            break;
        }
        let now = Instant::now();
        let (expired, stop) = {
            let mut state = shared.state.lock();
            let expired = state
                .typing
                .prune(now)
                .then(|| state.typing.display_names(now));
            (expired, state.debouncer.on_tick(now))
        };
        if let Some(names) = expired {
            shared.emit(ConversationEvent::TypingChanged(names));
        }
        if let Some(signal) = stop {
            send_typing(&outbound, signal);
        }
    }
}

fn send_typing(outbound: &FrameSender, signal: TypingSignal) {
    let frame = ClientFrame::Typing {
        is_typing: signal == TypingSignal::Start,
    };
    if let Err(e) = outbound.send(frame) {
        tracing::debug!(err = %e, ?signal, "typing signal not sent");
    }
}
