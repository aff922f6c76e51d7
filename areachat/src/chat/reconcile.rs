//! Source reconciliation: raw payloads from either origin become one
//! canonical [`Message`] shape.
//!
//! Web messages carry a populated author (or at least flat author fields).
//! Telegram messages are relayed by the bridge under a bot identity, so the
//! platform author is discarded and the display name is derived from the
//! Telegram sender fields instead.

use areachat_proto::event::{InboundEvent, RawAuthor, RawMessage, RawTelegram};
use areachat_proto::message::{
    Author, Message, MessageId, MessageKind, Provenance, TelegramAuthor, Timestamp, UserId,
};

use crate::chat::store::MessageStore;

/// Shown for web messages with no usable author name.
pub const ANONYMOUS_AUTHOR: &str = "Anónimo";

/// Shown for telegram messages with no usable sender fields.
pub const TELEGRAM_FALLBACK_NAME: &str = "Usuario de Telegram";

/// An inbound event, normalized and ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// A confirmed message to insert.
    Message(Message),
    /// A message to remove.
    Deleted(MessageId),
    /// A message to stamp with the edited marker.
    Edited {
        /// Target message.
        id: MessageId,
        /// Edit time.
        edited_at: Timestamp,
    },
    /// A remote user started typing.
    TypingStarted {
        /// Who.
        user_id: UserId,
        /// Name to show.
        display_name: String,
    },
    /// A remote user stopped typing.
    TypingStopped(UserId),
    /// Nothing usable; already logged.
    Ignored,
}

/// Normalize one raw message payload.
///
/// Returns `None` (with a warning) when the payload has no id. A missing or
/// unparseable creation time falls back to `received_at` and marks the
/// message as having an estimated timestamp.
#[must_use]
pub fn normalize(raw: &RawMessage, received_at: Timestamp) -> Option<Message> {
    let Some(id) = non_blank(raw.id.as_deref()) else {
        tracing::warn!(source = raw.source.as_deref().unwrap_or("-"), "message without id dropped");
        return None;
    };

    let provenance = raw
        .source
        .as_deref()
        .map_or(Provenance::Web, Provenance::from_tag);

    let (author, telegram) = match provenance {
        Provenance::Telegram => {
            let fields = raw.telegram.clone().unwrap_or_default();
            let author = Author {
                user_id: None,
                display_name: telegram_display_name(&fields),
                avatar_url: None,
            };
            (author, Some(telegram_author(fields)))
        }
        Provenance::Web => (web_author(raw), None),
    };

    let (created_at, timestamp_estimated) =
        match raw.created_at.as_ref().and_then(|ts| ts.resolve()) {
            Some(ts) => (ts, false),
            None => {
                tracing::debug!(id, "message without usable createdAt, using arrival time");
                (received_at, true)
            }
        };

    Some(Message {
        id: MessageId::new(id),
        author,
        body: raw.content.clone().unwrap_or_default(),
        kind: raw
            .kind
            .as_deref()
            .map_or(MessageKind::Text, MessageKind::from_tag),
        created_at,
        edited_at: raw.edited_at.as_ref().and_then(|ts| ts.resolve()),
        provenance,
        telegram,
        client_nonce: non_blank(raw.client_nonce.as_deref()).map(str::to_string),
        timestamp_estimated,
    })
}

/// Display name for a telegram sender.
///
/// `first last` when both are present, else the username, else whichever
/// single name exists, else [`TELEGRAM_FALLBACK_NAME`]. Blank fields count
/// as absent.
#[must_use]
pub fn telegram_display_name(fields: &RawTelegram) -> String {
    let first = non_blank(fields.from_first_name.as_deref());
    let last = non_blank(fields.from_last_name.as_deref());
    let username = non_blank(fields.from_username.as_deref());

    match (first, last, username) {
        (Some(first), Some(last), _) => format!("{first} {last}"),
        (_, _, Some(username)) => username.to_string(),
        (Some(name), None, None) | (None, Some(name), None) => name.to_string(),
        (None, None, None) => TELEGRAM_FALLBACK_NAME.to_string(),
    }
}

/// Turn a channel event into something the conversation can apply.
#[must_use]
pub fn reconcile(event: InboundEvent, received_at: Timestamp) -> Reconciled {
    match event {
        InboundEvent::MessageCreated { message } => {
            normalize(&message, received_at).map_or(Reconciled::Ignored, Reconciled::Message)
        }
        InboundEvent::MessageDeleted { message_id } => match non_blank(message_id.as_deref()) {
            Some(id) => Reconciled::Deleted(MessageId::new(id)),
            None => ignored("message:deleted"),
        },
        InboundEvent::MessageEdited {
            message_id,
            edited_at,
        } => match non_blank(message_id.as_deref()) {
            Some(id) => Reconciled::Edited {
                id: MessageId::new(id),
                edited_at: edited_at
                    .and_then(|ts| ts.resolve())
                    .unwrap_or(received_at),
            },
            None => ignored("message:edited"),
        },
        InboundEvent::TypingStarted { user_id, user_name } => {
            match non_blank(user_id.as_deref()) {
                Some(id) => Reconciled::TypingStarted {
                    user_id: UserId::new(id),
                    display_name: non_blank(user_name.as_deref())
                        .unwrap_or(ANONYMOUS_AUTHOR)
                        .to_string(),
                },
                None => ignored("typing:start"),
            }
        }
        InboundEvent::TypingStopped { user_id } => match non_blank(user_id.as_deref()) {
            Some(id) => Reconciled::TypingStopped(UserId::new(id)),
            None => ignored("typing:stop"),
        },
    }
}

/// Insert a confirmed message, resolving it against a pending local send
/// when the server echoed that send's nonce. Returns whether the store
/// changed.
pub fn apply_message(store: &mut MessageStore, message: Message) -> bool {
    if let Some(nonce) = message.client_nonce.clone() {
        let pending_id = MessageId::new(nonce);
        if store.get(&pending_id).is_some_and(|e| e.is_pending()) {
            return store.replace_pending(&pending_id, message);
        }
    }
    store.append(message)
}

fn web_author(raw: &RawMessage) -> Author {
    let (object_id, object_name, avatar_url) = match &raw.author {
        Some(RawAuthor::Object(obj)) => (obj.id.clone(), obj.name.clone(), obj.avatar.clone()),
        Some(RawAuthor::Id(id)) => (Some(id.clone()), None, None),
        None => (None, None, None),
    };

    let user_id = non_blank(object_id.as_deref())
        .or_else(|| non_blank(raw.author_id.as_deref()))
        .map(UserId::new);
    let display_name = non_blank(object_name.as_deref())
        .or_else(|| non_blank(raw.author_name.as_deref()))
        .unwrap_or(ANONYMOUS_AUTHOR)
        .to_string();

    Author {
        user_id,
        display_name,
        avatar_url: avatar_url.filter(|a| !a.trim().is_empty()),
    }
}

fn telegram_author(fields: RawTelegram) -> TelegramAuthor {
    let keep = |s: Option<String>| s.filter(|v| !v.trim().is_empty());
    TelegramAuthor {
        first_name: keep(fields.from_first_name),
        last_name: keep(fields.from_last_name),
        username: keep(fields.from_username),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn ignored(tag: &str) -> Reconciled {
    tracing::warn!(tag, "event without target id dropped");
    Reconciled::Ignored
}
