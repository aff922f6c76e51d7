//! In-memory per-area message history.
//!
//! The [`AreaHistory`] keeps every area's messages sorted oldest-first by
//! `(created_at, id)`. Server-assigned timestamps are strictly increasing so
//! two sends in the same millisecond still have a stable order.

use std::collections::HashMap;

use areachat_proto::api::HistoryPage;
use areachat_proto::event::RawMessage;
use areachat_proto::message::{
    AreaRef, Author, Message, MessageId, MessageKind, Provenance, TelegramAuthor, Timestamp,
    UserId,
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Why a delete was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeleteRefusal {
    /// No message with that id in the area.
    #[error("message not found")]
    NotFound,
    /// The requester did not write the message.
    #[error("only the author may delete a message")]
    NotAuthor,
}

/// The `before` cursor of a history request does not exist in the area.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown history cursor {0}")]
pub struct UnknownCursor(pub String);

/// Fields of a message before the store assigns its id and timestamp.
#[derive(Debug, Clone)]
pub struct Draft {
    /// Author of the message.
    pub author: Author,
    /// Body text.
    pub body: String,
    /// Type tag.
    pub kind: MessageKind,
    /// Originating system.
    pub provenance: Provenance,
    /// Telegram sender fields.
    pub telegram: Option<TelegramAuthor>,
    /// Nonce to echo back on the stored message.
    pub client_nonce: Option<String>,
    /// Externally assigned id (bridge messages); minted when absent.
    pub id: Option<String>,
    /// Externally assigned creation time; the server clock when absent.
    pub created_at: Option<Timestamp>,
}

impl Draft {
    /// A web-origin text message from a platform user.
    #[must_use]
    pub fn web(user_id: &str, name: &str, body: impl Into<String>) -> Self {
        Self {
            author: Author {
                user_id: Some(UserId::new(user_id)),
                display_name: name.to_string(),
                avatar_url: None,
            },
            body: body.into(),
            kind: MessageKind::Text,
            provenance: Provenance::Web,
            telegram: None,
            client_nonce: None,
            id: None,
            created_at: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    areas: HashMap<AreaRef, Vec<Message>>,
    last_millis: u64,
}

impl Inner {
    fn next_timestamp(&mut self) -> Timestamp {
        let now = Timestamp::now().as_millis();
        self.last_millis = now.max(self.last_millis + 1);
        Timestamp::from_millis(self.last_millis)
    }
}

/// Thread-safe history of every area the gateway has seen.
#[derive(Default)]
pub struct AreaHistory {
    inner: RwLock<Inner>,
}

impl AreaHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a message and returns it with its final id and timestamp.
    ///
    /// The second value is `false` when a draft carried an id that already
    /// exists in the area; the existing message is returned unchanged.
    pub async fn append(&self, area: &AreaRef, draft: Draft) -> (Message, bool) {
        let mut inner = self.inner.write().await;
        if let Some(id) = draft.id.as_deref()
            && let Some(existing) = inner
                .areas
                .get(area)
                .and_then(|messages| messages.iter().find(|m| m.id.as_str() == id))
        {
            return (existing.clone(), false);
        }

        let created_at = match draft.created_at {
            Some(ts) => ts,
            None => inner.next_timestamp(),
        };
        let id = draft
            .id
            .unwrap_or_else(|| Uuid::now_v7().simple().to_string());
        let message = Message {
            id: MessageId::new(id),
            author: draft.author,
            body: draft.body,
            kind: draft.kind,
            created_at,
            edited_at: None,
            provenance: draft.provenance,
            telegram: draft.telegram,
            client_nonce: draft.client_nonce,
            timestamp_estimated: false,
        };

        let messages = inner.areas.entry(area.clone()).or_default();
        let position = messages.partition_point(|m| m.order_key() <= message.order_key());
        messages.insert(position, message.clone());
        drop(inner);
        (message, true)
    }

    /// Up to `limit` messages strictly older than `before` (or the newest
    /// ones when `before` is `None`), oldest-first.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCursor`] if `before` names no message in the area.
    pub async fn page(
        &self,
        area: &AreaRef,
        before: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage, UnknownCursor> {
        let inner = self.inner.read().await;
        let messages = inner.areas.get(area).map_or(&[][..], Vec::as_slice);

        let end = match before {
            Some(cursor) => messages
                .iter()
                .position(|m| m.id.as_str() == cursor)
                .ok_or_else(|| UnknownCursor(cursor.to_string()))?,
            None => messages.len(),
        };
        let start = end.saturating_sub(limit);

        Ok(HistoryPage {
            messages: messages[start..end].iter().map(RawMessage::from).collect(),
            has_more: start > 0,
        })
    }

    /// Removes a message written by `requester`.
    ///
    /// # Errors
    ///
    /// [`DeleteRefusal::NotFound`] if the id is unknown in the area,
    /// [`DeleteRefusal::NotAuthor`] if someone else wrote it.
    pub async fn delete(
        &self,
        area: &AreaRef,
        id: &str,
        requester: &UserId,
    ) -> Result<Message, DeleteRefusal> {
        let mut inner = self.inner.write().await;
        let messages = inner.areas.get_mut(area).ok_or(DeleteRefusal::NotFound)?;
        let index = messages
            .iter()
            .position(|m| m.id.as_str() == id)
            .ok_or(DeleteRefusal::NotFound)?;
        if !messages[index].is_authored_by(requester) {
            return Err(DeleteRefusal::NotAuthor);
        }
        Ok(messages.remove(index))
    }

    /// Number of messages stored for the area.
    pub async fn len(&self, area: &AreaRef) -> usize {
        self.inner.read().await.areas.get(area).map_or(0, Vec::len)
    }
}
