//! In-process backend double.
//!
//! Holds per-area history in memory, counts calls, and can be told to fail
//! or stall, so conversation behaviour can be tested without HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use areachat_proto::api::{AssistantAnswer, AssistantQuestion, HistoryPage, SendMessageRequest};
use areachat_proto::event::RawMessage;
use areachat_proto::message::{
    AreaRef, Author, Message, MessageId, MessageKind, Provenance, Timestamp, UserId,
};

use super::{Assistant, BackendError, ChatBackend};

/// Starting point of the backend's synthetic clock (2024-05-01T10:00:00Z).
const CLOCK_START_MS: u64 = 1_714_557_600_000;

#[derive(Debug)]
struct State {
    history: HashMap<AreaRef, Vec<Message>>,
    author: Author,
    clock_ms: u64,
    next_id: u64,
    history_delay: Option<Duration>,
    send_delay: Option<Duration>,
    history_error: Option<BackendError>,
    send_error: Option<BackendError>,
    delete_error: Option<BackendError>,
    answer: AssistantAnswer,
    sent: Vec<SendMessageRequest>,
    questions: Vec<AssistantQuestion>,
}

#[derive(Debug, Default)]
struct Calls {
    history: AtomicUsize,
    send: AtomicUsize,
    delete: AtomicUsize,
    ask: AtomicUsize,
}

/// Scriptable in-memory [`ChatBackend`] and [`Assistant`].
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
    calls: Arc<Calls>,
}

impl InMemoryBackend {
    /// A backend whose sends are authored by `author`.
    #[must_use]
    pub fn new(author: Author) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                history: HashMap::new(),
                author,
                clock_ms: CLOCK_START_MS,
                next_id: 1,
                history_delay: None,
                send_delay: None,
                history_error: None,
                send_error: None,
                delete_error: None,
                answer: AssistantAnswer {
                    answer: "Sin datos".into(),
                    sources: Vec::new(),
                },
                sent: Vec::new(),
                questions: Vec::new(),
            })),
            calls: Arc::new(Calls::default()),
        }
    }

    /// Add confirmed messages to an area's history.
    pub fn seed(&self, area: &AreaRef, messages: impl IntoIterator<Item = Message>) {
        let mut state = self.state.lock();
        let history = state.history.entry(area.clone()).or_default();
        history.extend(messages);
        history.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    }

    /// Current history of an area, oldest first.
    #[must_use]
    pub fn history(&self, area: &AreaRef) -> Vec<Message> {
        self.state.lock().history.get(area).cloned().unwrap_or_default()
    }

    /// Delay every history fetch.
    pub fn set_history_delay(&self, delay: Option<Duration>) {
        self.state.lock().history_delay = delay;
    }

    /// Delay every send.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.state.lock().send_delay = delay;
    }

    /// Make history fetches fail until cleared.
    pub fn fail_history(&self, error: Option<BackendError>) {
        self.state.lock().history_error = error;
    }

    /// Make sends fail until cleared.
    pub fn fail_sends(&self, error: Option<BackendError>) {
        self.state.lock().send_error = error;
    }

    /// Make deletes fail until cleared.
    pub fn fail_deletes(&self, error: Option<BackendError>) {
        self.state.lock().delete_error = error;
    }

    /// Set the assistant's canned answer.
    pub fn set_answer(&self, answer: AssistantAnswer) {
        self.state.lock().answer = answer;
    }

    /// Requests received by `send_message`, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.state.lock().sent.clone()
    }

    /// Questions received by the assistant, in order.
    #[must_use]
    pub fn questions(&self) -> Vec<AssistantQuestion> {
        self.state.lock().questions.clone()
    }

    /// Number of `fetch_history` calls.
    #[must_use]
    pub fn history_calls(&self) -> usize {
        self.calls.history.load(Ordering::SeqCst)
    }

    /// Number of `send_message` calls.
    #[must_use]
    pub fn send_calls(&self) -> usize {
        self.calls.send.load(Ordering::SeqCst)
    }

    /// Number of `delete_message` calls.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.calls.delete.load(Ordering::SeqCst)
    }

    /// Number of `ask` calls.
    #[must_use]
    pub fn ask_calls(&self) -> usize {
        self.calls.ask.load(Ordering::SeqCst)
    }
}

impl ChatBackend for InMemoryBackend {
    async fn fetch_history(
        &self,
        area: &AreaRef,
        before: Option<&MessageId>,
        limit: usize,
    ) -> Result<HistoryPage, BackendError> {
        self.calls.history.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().history_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if let Some(err) = state.history_error.clone() {
            return Err(err);
        }
        let history = state.history.get(area).map(Vec::as_slice).unwrap_or_default();
        let end = match before {
            Some(id) => history
                .iter()
                .position(|m| &m.id == id)
                .ok_or(BackendError::NotFound)?,
            None => history.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(HistoryPage {
            messages: history[start..end].iter().map(RawMessage::from).collect(),
            has_more: start > 0,
        })
    }

    async fn send_message(
        &self,
        area: &AreaRef,
        request: &SendMessageRequest,
    ) -> Result<RawMessage, BackendError> {
        self.calls.send.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.sent.push(request.clone());
        if let Some(err) = state.send_error.clone() {
            return Err(err);
        }
        state.clock_ms += 1_000;
        let id = format!("srv-{}", state.next_id);
        state.next_id += 1;
        let message = Message {
            id: MessageId::new(id),
            author: state.author.clone(),
            body: request.content.clone(),
            kind: MessageKind::from_tag(&request.kind),
            created_at: Timestamp::from_millis(state.clock_ms),
            edited_at: None,
            provenance: Provenance::Web,
            telegram: None,
            client_nonce: request.client_nonce.clone(),
            timestamp_estimated: false,
        };
        let raw = RawMessage::from(&message);
        state.history.entry(area.clone()).or_default().push(message);
        Ok(raw)
    }

    async fn delete_message(&self, area: &AreaRef, id: &MessageId) -> Result<(), BackendError> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(err) = state.delete_error.clone() {
            return Err(err);
        }
        let me = state.author.user_id.clone();
        let history = state.history.get_mut(area).ok_or(BackendError::NotFound)?;
        let index = history
            .iter()
            .position(|m| &m.id == id)
            .ok_or(BackendError::NotFound)?;
        if !me.is_some_and(|me: UserId| history[index].is_authored_by(&me)) {
            return Err(BackendError::Forbidden);
        }
        history.remove(index);
        Ok(())
    }
}

impl Assistant for InMemoryBackend {
    async fn ask(&self, question: &AssistantQuestion) -> Result<AssistantAnswer, BackendError> {
        self.calls.ask.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.questions.push(question.clone());
        Ok(state.answer.clone())
    }
}
