//! REST collaborators: history, send, delete and the assistant.
//!
//! The conversation only sees the [`ChatBackend`] and [`Assistant`] traits.
//! [`rest::RestBackend`] implements both over HTTP; [`memory::InMemoryBackend`]
//! is a scriptable in-process double for tests.

pub mod memory;
pub mod rest;

use std::future::Future;

use areachat_proto::api::{AssistantAnswer, AssistantQuestion, HistoryPage, SendMessageRequest};
use areachat_proto::event::RawMessage;
use areachat_proto::message::{AreaRef, MessageId};

/// Errors returned by a backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The credential was missing or refused.
    #[error("unauthorized")]
    Unauthorized,

    /// The caller may not perform this action (e.g. deleting someone else's message).
    #[error("forbidden")]
    Forbidden,

    /// The area or message does not exist.
    #[error("not found")]
    NotFound,

    /// Any other non-success status.
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error text from the body, if any.
        message: String,
    },

    /// The request never completed.
    #[error("network error: {0}")]
    Network(String),

    /// The response body did not have the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),

    /// The request exceeded its timeout.
    #[error("request timed out")]
    Timeout,
}

/// The REST half of the chat contract.
pub trait ChatBackend: Send + Sync + 'static {
    /// Fetch up to `limit` messages strictly older than `before`, or the
    /// newest page when `before` is `None`.
    fn fetch_history(
        &self,
        area: &AreaRef,
        before: Option<&MessageId>,
        limit: usize,
    ) -> impl Future<Output = Result<HistoryPage, BackendError>> + Send;

    /// Send a message and return the confirmed record.
    fn send_message(
        &self,
        area: &AreaRef,
        request: &SendMessageRequest,
    ) -> impl Future<Output = Result<RawMessage, BackendError>> + Send;

    /// Delete a message. Only its author may do so.
    fn delete_message(
        &self,
        area: &AreaRef,
        id: &MessageId,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// The AI assistant collaborator.
pub trait Assistant: Send + Sync + 'static {
    /// Ask a question scoped to an area.
    fn ask(
        &self,
        question: &AssistantQuestion,
    ) -> impl Future<Output = Result<AssistantAnswer, BackendError>> + Send;
}
