//! Delivery contract for outgoing actions.
//!
//! A send moves `Idle → Pending → Confirmed | Failed`; a delete moves
//! `Requested → Confirmed | Failed`. The [`Outbox`] records both per id so a
//! view can render status and offer retry. It never touches the message
//! store; the conversation applies the optimistic insert and the rollback.
//!
//! Confirmed records drop their body and only the most recent
//! [`SETTLED_HISTORY`] of them are remembered; older ones read as idle.

use std::collections::{HashMap, VecDeque};

use areachat_proto::api::AssistantAnswer;
use areachat_proto::message::{MessageId, ValidationError, validate_body};

use crate::backend::BackendError;

/// Leading token that routes input to the assistant.
pub const DEFAULT_ASSISTANT_PREFIX: &str = "/ia";

/// How many confirmed sends and deletes the outbox keeps answering for.
pub const SETTLED_HISTORY: usize = 256;

/// What a line of user input should turn into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// A normal chat message.
    Message(String),
    /// A question for the assistant (prefix stripped, trimmed).
    Assistant(String),
}

/// Errors from a send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The body failed local validation; nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The assistant prefix had nothing after it; nothing was sent.
    #[error("write a question after the assistant prefix")]
    EmptyAssistantQuery,

    /// The backend refused or failed the request.
    #[error("send failed: {0}")]
    Backend(BackendError),

    /// No response within the send timeout.
    #[error("send timed out")]
    Timeout,

    /// The conversation was closed.
    #[error("conversation closed")]
    Closed,

    /// Retry was asked for a send that is not in the failed state.
    #[error("message {0} has no failed send to retry")]
    NotRetryable(MessageId),
}

/// Errors from a delete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeleteError {
    /// The message is not in the store.
    #[error("message not found")]
    NotFound,

    /// The message has not been confirmed yet.
    #[error("message is still being sent")]
    Pending,

    /// A delete for this message is already in flight.
    #[error("delete already requested")]
    AlreadyRequested,

    /// The backend refused or failed the request.
    #[error("delete failed: {0}")]
    Backend(BackendError),

    /// No response within the delete timeout.
    #[error("delete timed out")]
    Timeout,

    /// The conversation was closed.
    #[error("conversation closed")]
    Closed,
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was confirmed under this server id.
    Sent(MessageId),
    /// The input went to the assistant; the answer is not a chat message.
    Answered(AssistantAnswer),
}

/// State of one send, keyed by its local id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
    /// Nothing recorded for this id.
    Idle,
    /// Optimistically shown, awaiting the server.
    Pending,
    /// Confirmed under the given server id.
    Confirmed(MessageId),
    /// Rolled back; retry is available.
    Failed {
        /// Error shown to the user.
        reason: String,
    },
}

/// State of one delete, keyed by the message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteState {
    /// Awaiting the server.
    Requested,
    /// Removed from the store.
    Confirmed,
    /// The entry stays; the error is surfaced.
    Failed {
        /// Error shown to the user.
        reason: String,
    },
}

/// Split input into a chat message or an assistant question.
///
/// The prefix only counts when followed by whitespace or the end of input,
/// so `/iago` is a normal message.
///
/// # Errors
///
/// [`SendError::EmptyAssistantQuery`] for a bare prefix, and
/// [`SendError::Validation`] for an empty or oversized message.
pub fn classify_input(text: &str, prefix: &str) -> Result<Outgoing, SendError> {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix(prefix)
        && rest.chars().next().is_none_or(char::is_whitespace)
    {
        let question = rest.trim();
        if question.is_empty() {
            return Err(SendError::EmptyAssistantQuery);
        }
        validate_body(question)?;
        return Ok(Outgoing::Assistant(question.to_string()));
    }
    validate_body(text)?;
    Ok(Outgoing::Message(text.to_string()))
}

#[derive(Debug, Clone)]
struct SendRecord {
    body: String,
    state: SendState,
}

#[derive(Debug, Clone)]
enum Settled {
    Send(MessageId),
    Delete(MessageId),
}

/// Per-id bookkeeping for sends and deletes.
#[derive(Debug, Default)]
pub struct Outbox {
    sends: HashMap<MessageId, SendRecord>,
    deletes: HashMap<MessageId, DeleteState>,
    settled: VecDeque<Settled>,
}

impl Outbox {
    /// Empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending send.
    pub fn begin_send(&mut self, local_id: MessageId, body: String) {
        self.sends.insert(
            local_id,
            SendRecord {
                body,
                state: SendState::Pending,
            },
        );
    }

    /// Mark a send confirmed. Returns `false` if it was already confirmed.
    pub fn confirm_send(&mut self, local_id: &MessageId, server_id: MessageId) -> bool {
        match self.sends.get_mut(local_id) {
            Some(record) if !matches!(record.state, SendState::Confirmed(_)) => {
                record.state = SendState::Confirmed(server_id);
                record.body = String::new();
                self.settle(Settled::Send(local_id.clone()));
                true
            }
            _ => false,
        }
    }

    /// Mark a pending send failed. A send the live echo already confirmed
    /// stays confirmed, and `false` is returned.
    pub fn fail_send(&mut self, local_id: &MessageId, reason: String) -> bool {
        match self.sends.get_mut(local_id) {
            Some(record) if record.state == SendState::Pending => {
                record.state = SendState::Failed { reason };
                true
            }
            _ => false,
        }
    }

    /// Take the body of a failed send for re-dispatch, forgetting the record.
    ///
    /// # Errors
    ///
    /// [`SendError::NotRetryable`] unless the send is in the failed state.
    pub fn take_failed(&mut self, local_id: &MessageId) -> Result<String, SendError> {
        match self.sends.get(local_id) {
            Some(SendRecord {
                state: SendState::Failed { .. },
                ..
            }) => Ok(self
                .sends
                .remove(local_id)
                .map(|r| r.body)
                .unwrap_or_default()),
            _ => Err(SendError::NotRetryable(local_id.clone())),
        }
    }

    /// Current state of a send.
    #[must_use]
    pub fn send_state(&self, local_id: &MessageId) -> SendState {
        self.sends
            .get(local_id)
            .map_or(SendState::Idle, |r| r.state.clone())
    }

    /// Local ids of sends that failed and can be retried.
    #[must_use]
    pub fn failed_sends(&self) -> Vec<MessageId> {
        let mut ids: Vec<_> = self
            .sends
            .iter()
            .filter(|(_, r)| matches!(r.state, SendState::Failed { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Record a delete request.
    ///
    /// # Errors
    ///
    /// [`DeleteError::AlreadyRequested`] if one is already in flight.
    pub fn begin_delete(&mut self, id: MessageId) -> Result<(), DeleteError> {
        if self.deletes.get(&id) == Some(&DeleteState::Requested) {
            return Err(DeleteError::AlreadyRequested);
        }
        self.deletes.insert(id, DeleteState::Requested);
        Ok(())
    }

    /// Mark a delete confirmed.
    pub fn confirm_delete(&mut self, id: &MessageId) {
        if self.deletes.insert(id.clone(), DeleteState::Confirmed) != Some(DeleteState::Confirmed) {
            self.settle(Settled::Delete(id.clone()));
        }
    }

    /// Mark a delete failed.
    pub fn fail_delete(&mut self, id: &MessageId, reason: String) {
        self.deletes
            .insert(id.clone(), DeleteState::Failed { reason });
    }

    /// Current state of a delete, if one was ever requested.
    #[must_use]
    pub fn delete_state(&self, id: &MessageId) -> Option<DeleteState> {
        self.deletes.get(id).cloned()
    }

    /// Number of records held, in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sends.len() + self.deletes.len()
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.deletes.is_empty()
    }

    fn settle(&mut self, entry: Settled) {
        self.settled.push_back(entry);
        while self.settled.len() > SETTLED_HISTORY {
            match self.settled.pop_front() {
                Some(Settled::Send(id)) => {
                    if self
                        .sends
                        .get(&id)
                        .is_some_and(|r| matches!(r.state, SendState::Confirmed(_)))
                    {
                        self.sends.remove(&id);
                    }
                }
                Some(Settled::Delete(id)) => {
                    if self.deletes.get(&id) == Some(&DeleteState::Confirmed) {
                        self.deletes.remove(&id);
                    }
                }
                None => break,
            }
        }
    }
}
