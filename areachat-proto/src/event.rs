//! Raw inbound payloads from the live channel and the REST history API.
//!
//! These shapes are deliberately loose: every field is optional and the
//! common aliases used by the backend are accepted. A payload that decodes
//! here can still be rejected by the client-side reconciler (for example a
//! message without an id); that rejection is logged and never stops the
//! stream.

use serde::{Deserialize, Serialize};

use crate::message::{Message, Provenance, Timestamp};

/// A message-shaped record, as sent by the backend or the Telegram bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    /// Server- or bridge-assigned identifier.
    #[serde(rename = "_id", alias = "id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Body text.
    #[serde(alias = "body", alias = "text", default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Populated author (REST history) or a bare author id (some live payloads).
    #[serde(alias = "user", alias = "sender", default, skip_serializing_if = "Option::is_none")]
    pub author: Option<RawAuthor>,
    /// Flat author id used by payloads without an author object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    /// Flat author name used by payloads without an author object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<RawTimestamp>,
    /// Edit time, when the message was edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<RawTimestamp>,
    /// Provenance tag: `web` (default) or `telegram`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Telegram author fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<RawTelegram>,
    /// Message type tag.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Nonce echoed from the send request that created this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<String>,
}

impl RawMessage {
    /// Whether the payload claims to come from the Telegram bridge.
    #[must_use]
    pub fn is_telegram(&self) -> bool {
        self.source
            .as_deref()
            .is_some_and(|s| Provenance::from_tag(s) == Provenance::Telegram)
    }
}

impl From<&Message> for RawMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: Some(message.id.to_string()),
            content: Some(message.body.clone()),
            author: Some(RawAuthor::Object(RawAuthorObject {
                id: message.author.user_id.as_ref().map(ToString::to_string),
                name: Some(message.author.display_name.clone()),
                avatar: message.author.avatar_url.clone(),
            })),
            author_id: None,
            author_name: None,
            created_at: Some(RawTimestamp::Text(message.created_at.to_rfc3339())),
            edited_at: message
                .edited_at
                .map(|ts| RawTimestamp::Text(ts.to_rfc3339())),
            source: Some(message.provenance.to_string()),
            telegram: message.telegram.as_ref().map(|tg| RawTelegram {
                from_first_name: tg.first_name.clone(),
                from_last_name: tg.last_name.clone(),
                from_username: tg.username.clone(),
            }),
            kind: Some(message.kind.as_tag().to_string()),
            client_nonce: message.client_nonce.clone(),
        }
    }
}

/// Author as carried by a raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAuthor {
    /// A populated author object.
    Object(RawAuthorObject),
    /// Only the author's id.
    Id(String),
}

/// Populated author object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAuthorObject {
    /// Platform user id.
    #[serde(rename = "_id", alias = "id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display name.
    #[serde(alias = "displayName", alias = "fullName", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Avatar URL.
    #[serde(alias = "avatarUrl", default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Telegram-specific author fields supplied by the bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTelegram {
    /// Sender first name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_first_name: Option<String>,
    /// Sender last name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_last_name: Option<String>,
    /// Sender username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_username: Option<String>,
}

/// A timestamp as RFC 3339 text or epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Milliseconds since the UNIX epoch.
    Millis(i64),
    /// RFC 3339 date-time.
    Text(String),
}

impl RawTimestamp {
    /// Resolves to a [`Timestamp`]; `None` if malformed or before the epoch.
    #[must_use]
    pub fn resolve(&self) -> Option<Timestamp> {
        match self {
            Self::Millis(ms) => u64::try_from(*ms).ok().map(Timestamp::from_millis),
            Self::Text(text) => Timestamp::parse_rfc3339(text),
        }
    }
}

impl From<Timestamp> for RawTimestamp {
    fn from(ts: Timestamp) -> Self {
        Self::Text(ts.to_rfc3339())
    }
}

/// Events pushed by the server on an area channel.
///
/// The transport does not guarantee exactly-once delivery; consumers must
/// apply these idempotently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    /// A confirmed message was created (web send or Telegram relay).
    #[serde(rename = "message:new")]
    MessageCreated {
        /// The message payload.
        message: RawMessage,
    },
    /// A message was deleted by its author.
    #[serde(rename = "message:deleted", rename_all = "camelCase")]
    MessageDeleted {
        /// Id of the deleted message.
        #[serde(default)]
        message_id: Option<String>,
    },
    /// A message received an edited marker.
    #[serde(rename = "message:edited", rename_all = "camelCase")]
    MessageEdited {
        /// Id of the edited message.
        #[serde(default)]
        message_id: Option<String>,
        /// When the edit happened.
        #[serde(default)]
        edited_at: Option<RawTimestamp>,
    },
    /// A user started typing in the area.
    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStarted {
        /// The typing user.
        #[serde(default)]
        user_id: Option<String>,
        /// Their display name.
        #[serde(default)]
        user_name: Option<String>,
    },
    /// A user stopped typing.
    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStopped {
        /// The user who stopped.
        #[serde(default)]
        user_id: Option<String>,
    },
}

impl InboundEvent {
    /// Wire tag of this event, for logging.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::MessageCreated { .. } => "message:new",
            Self::MessageDeleted { .. } => "message:deleted",
            Self::MessageEdited { .. } => "message:edited",
            Self::TypingStarted { .. } => "typing:start",
            Self::TypingStopped { .. } => "typing:stop",
        }
    }
}
