//! Canonical message types for area conversations.
//!
//! Whatever system created a message (the web backend or the Telegram bridge),
//! a chat view only ever renders a [`Message`]. Loose inbound shapes live in
//! [`crate::event`]; the client-side reconciler turns those into these types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message body size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Prefix of ids minted locally for optimistic (not yet confirmed) sends.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Milliseconds in one UTC day.
const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an identifier issued by the backend.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Globally unique message identifier, assigned by whichever system
    /// created the message. The sole deduplication key.
    MessageId
);

string_id!(
    /// Stable user identifier supplied by the auth/session provider.
    UserId
);

string_id!(
    /// Team identifier.
    TeamId
);

string_id!(
    /// Area (sub-team collaboration space) identifier.
    AreaId
);

impl MessageId {
    /// Mints a local id for an optimistic send (`local-<uuid v7>`).
    ///
    /// The same string is sent to the backend as the client nonce, so the
    /// confirmed message can be matched back to its pending entry.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Whether this id was minted locally (the message is unconfirmed).
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }
}

/// A (team, area) pair scoping one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AreaRef {
    /// Owning team.
    pub team_id: TeamId,
    /// Area within the team.
    pub area_id: AreaId,
}

impl AreaRef {
    /// Creates a new area reference.
    pub fn new(team_id: impl Into<String>, area_id: impl Into<String>) -> Self {
        Self {
            team_id: TeamId::new(team_id),
            area_id: AreaId::new(area_id),
        }
    }
}

impl std::fmt::Display for AreaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.team_id, self.area_id)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Parses an RFC 3339 date-time (`2024-05-01T10:00:00.000Z`).
    ///
    /// Returns `None` for malformed input or instants before the epoch.
    #[must_use]
    pub fn parse_rfc3339(text: &str) -> Option<Self> {
        let parsed = chrono::DateTime::parse_from_rfc3339(text).ok()?;
        u64::try_from(parsed.timestamp_millis()).ok().map(Self)
    }

    /// Formats the timestamp as RFC 3339 with millisecond precision.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        let millis = i64::try_from(self.0).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(millis).map_or_else(
            || format!("{}ms", self.0),
            |dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        )
    }

    /// Days since the UNIX epoch (UTC).
    #[must_use]
    pub const fn utc_day(&self) -> u64 {
        self.0 / MILLIS_PER_DAY
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Originating system of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Sent from a native web client through the backend.
    #[default]
    Web,
    /// Relayed from the linked Telegram group by the bridge.
    Telegram,
}

impl Provenance {
    /// Parses the wire tag; anything that is not `telegram` is web-origin.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        if tag.eq_ignore_ascii_case("telegram") {
            Self::Telegram
        } else {
            Self::Web
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Telegram => write!(f, "telegram"),
        }
    }
}

/// Message type tag sent with every send request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// A shared file announcement.
    File,
    /// Generated by the platform itself.
    System,
}

impl MessageKind {
    /// Parses the wire tag, treating unknown tags as text.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "file" => Self::File,
            "system" => Self::System,
            _ => Self::Text,
        }
    }

    /// The wire tag for this kind.
    #[must_use]
    pub const fn as_tag(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
            Self::System => "system",
        }
    }
}

/// Who wrote a message, as far as the chat view is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// Platform user id; absent for anonymous and telegram-origin authors.
    pub user_id: Option<UserId>,
    /// Name to render next to the message. Never empty.
    pub display_name: String,
    /// Avatar URL, when the payload carried one.
    pub avatar_url: Option<String>,
}

/// Author fields specific to telegram-origin messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramAuthor {
    /// Telegram first name.
    pub first_name: Option<String>,
    /// Telegram last name.
    pub last_name: Option<String>,
    /// Telegram `@username` without the `@`.
    pub username: Option<String>,
}

/// The canonical message record a chat view renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier (deduplication key).
    pub id: MessageId,
    /// Author reference.
    pub author: Author,
    /// Body text.
    pub body: String,
    /// Type tag.
    pub kind: MessageKind,
    /// Creation instant; primary ordering key.
    pub created_at: Timestamp,
    /// Set when the message was edited. Only the marker is rendered.
    pub edited_at: Option<Timestamp>,
    /// Originating system.
    pub provenance: Provenance,
    /// Telegram author fields (only for telegram-origin messages).
    pub telegram: Option<TelegramAuthor>,
    /// Nonce of the optimistic send this message confirms, echoed by the server.
    pub client_nonce: Option<String>,
    /// `true` when `created_at` was missing and replaced by the arrival time.
    /// Such messages do not open a date separator.
    pub timestamp_estimated: bool,
}

impl Message {
    /// Whether the given user wrote this message.
    #[must_use]
    pub fn is_authored_by(&self, user: &UserId) -> bool {
        self.author.user_id.as_ref() == Some(user)
    }

    /// Whether the message carries an edited marker.
    #[must_use]
    pub const fn is_edited(&self) -> bool {
        self.edited_at.is_some()
    }

    /// Total-order key: creation time, then id as tie-break.
    #[must_use]
    pub fn order_key(&self) -> (Timestamp, &MessageId) {
        (self.created_at, &self.id)
    }
}

/// Error returned when a message body fails local validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Body is empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// Body exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the body in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates a body before it is sent.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank text, or
/// [`ValidationError::TooLarge`] above [`MAX_MESSAGE_SIZE`].
pub fn validate_body(text: &str) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = text.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
