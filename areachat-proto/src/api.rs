//! Request and response bodies of the area REST API.
//!
//! Routes (all under a bearer credential):
//!
//! - `GET  /api/teams/{team}/areas/{area}/messages?before=&limit=` → [`HistoryPage`]
//! - `POST /api/teams/{team}/areas/{area}/messages` ← [`SendMessageRequest`] → [`RawMessage`]
//! - `DELETE /api/teams/{team}/areas/{area}/messages/{id}` → `204`
//! - `POST /api/teams/{team}/areas/{area}/telegram` ← [`TelegramRelayRequest`] → [`RawMessage`]
//! - `POST /api/assistant/ask` ← [`AssistantQuestion`] → [`AssistantAnswer`]

use serde::{Deserialize, Deserializer, Serialize};

use crate::event::{RawMessage, RawTelegram, RawTimestamp};

/// Default and maximum history page sizes.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// One page of history, newest-last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    /// Messages in the page.
    ///
    /// A record that does not fit [`RawMessage`] decodes as an empty one, so
    /// the page keeps its length and the reconciler drops that record alone.
    #[serde(default, deserialize_with = "lenient_records")]
    pub messages: Vec<RawMessage>,
    /// Whether older messages exist beyond this page.
    #[serde(default)]
    pub has_more: bool,
}

fn lenient_records<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<RawMessage>, D::Error> {
    let records = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(records
        .into_iter()
        .map(|record| RawMessage::deserialize(record).unwrap_or_default())
        .collect())
}

/// Query string of the history route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Exclusive upper bound: only messages strictly older than this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    /// Page size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Body of a send request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Message text.
    pub content: String,
    /// Message type tag.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    /// Client-generated nonce, echoed back on the created message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<String>,
}

fn default_kind() -> String {
    "text".to_string()
}

/// Body the Telegram bridge posts to inject a message into an area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramRelayRequest {
    /// Bridge-side message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Message text.
    pub content: String,
    /// Telegram sender fields.
    #[serde(default)]
    pub telegram: RawTelegram,
    /// When Telegram received the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<RawTimestamp>,
}

/// Question for the assistant service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantQuestion {
    /// The query text with the command prefix stripped.
    pub question: String,
    /// Team of the asking area.
    pub team_id: String,
    /// The asking area.
    pub area_id: String,
}

/// Answer from the assistant service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantAnswer {
    /// Answer text.
    pub answer: String,
    /// Documents or links the answer was drawn from.
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Error body returned by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Human-readable reason.
    pub error: String,
}
