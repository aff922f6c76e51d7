//! Ordered, deduplicated message store for one area.
//!
//! Entries are kept sorted by `(created_at, id)` in a `Vec`, with a `HashSet`
//! of ids as the deduplication index. Live arrivals, history pages, and
//! optimistic sends all go through the same ordered insert, so the store is
//! chronological no matter which order the network delivered things in.
//! Every mutation is synchronous.

use std::collections::HashSet;

use areachat_proto::message::{Message, MessageId, Timestamp};

/// Whether a stored entry has been acknowledged by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Known to the server.
    Confirmed,
    /// Optimistic local send awaiting acknowledgement.
    Pending,
}

/// A message plus its delivery tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// The message.
    pub message: Message,
    /// Confirmed or pending.
    pub delivery: Delivery,
}

impl StoredMessage {
    /// Whether this entry is an unacknowledged local send.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.delivery == Delivery::Pending
    }
}

/// The single source of truth a chat view renders.
#[derive(Debug, Clone)]
pub struct MessageStore {
    entries: Vec<StoredMessage>,
    ids: HashSet<MessageId>,
    has_more: bool,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    /// An empty store. Until the first page says otherwise, older history
    /// is assumed to exist.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            ids: HashSet::new(),
            has_more: true,
        }
    }

    /// Insert a confirmed message at its ordered position.
    ///
    /// Returns `false` (and changes nothing) if the id is already present.
    /// Two distinct ids with identical text and time are both kept.
    pub fn append(&mut self, message: Message) -> bool {
        self.insert(message, Delivery::Confirmed)
    }

    /// Insert an optimistic local send.
    pub fn append_pending(&mut self, message: Message) -> bool {
        self.insert(message, Delivery::Pending)
    }

    /// Merge a page of older history and update the `has_more` boundary.
    ///
    /// Ids already present are skipped. Returns how many entries were added.
    pub fn prepend_page(&mut self, older: Vec<Message>, has_more: bool) -> usize {
        let mut inserted = 0;
        for message in older {
            if self.append(message) {
                inserted += 1;
            }
        }
        self.has_more = has_more;
        inserted
    }

    /// Delete by id. No-op if absent.
    pub fn remove(&mut self, id: &MessageId) -> Option<StoredMessage> {
        if !self.ids.remove(id) {
            return None;
        }
        let index = self.entries.iter().position(|e| &e.message.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Swap a pending entry for its confirmed message.
    ///
    /// The confirmed copy lands at its own time-ordered position (the server
    /// timestamp may differ from the optimistic one). If the confirmed id is
    /// already present, for instance because the live echo won the race,
    /// only the pending entry is dropped. Returns whether anything changed.
    pub fn replace_pending(&mut self, pending_id: &MessageId, confirmed: Message) -> bool {
        let removed = match self.get(pending_id) {
            Some(entry) if entry.is_pending() => self.remove(pending_id).is_some(),
            _ => false,
        };
        let inserted = self.append(confirmed);
        removed || inserted
    }

    /// Stamp the edited marker. The body is never touched.
    pub fn mark_edited(&mut self, id: &MessageId, edited_at: Timestamp) -> bool {
        match self.entries.iter_mut().find(|e| &e.message.id == id) {
            Some(entry) if entry.message.edited_at != Some(edited_at) => {
                entry.message.edited_at = Some(edited_at);
                true
            }
            _ => false,
        }
    }

    /// All entries, chronological ascending.
    #[must_use]
    pub fn ordered(&self) -> &[StoredMessage] {
        &self.entries
    }

    /// Look up an entry by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&StoredMessage> {
        if !self.ids.contains(id) {
            return None;
        }
        self.entries.iter().find(|e| &e.message.id == id)
    }

    /// Whether an id is present.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Number of entries, pending included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any confirmed entry exists.
    #[must_use]
    pub fn has_confirmed(&self) -> bool {
        self.entries.iter().any(|e| !e.is_pending())
    }

    /// The boundary cursor for the next "load older" request.
    #[must_use]
    pub fn oldest_confirmed_id(&self) -> Option<&MessageId> {
        self.entries
            .iter()
            .find(|e| !e.is_pending())
            .map(|e| &e.message.id)
    }

    /// Whether older history may still exist.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }

    /// Whether a date separator belongs above entry `index`.
    ///
    /// True for the first entry and whenever the UTC day changes, except for
    /// entries whose timestamp was estimated on arrival.
    #[must_use]
    pub fn starts_new_day(&self, index: usize) -> bool {
        let Some(entry) = self.entries.get(index) else {
            return false;
        };
        if entry.message.timestamp_estimated {
            return false;
        }
        let day = entry.message.created_at.utc_day();
        self.entries[..index]
            .iter()
            .rev()
            .find(|e| !e.message.timestamp_estimated)
            .is_none_or(|prev| prev.message.created_at.utc_day() != day)
    }

    fn insert(&mut self, message: Message, delivery: Delivery) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        let key = message.order_key();
        let index = self
            .entries
            .partition_point(|e| e.message.order_key() < key);
        self.ids.insert(message.id.clone());
        self.entries.insert(index, StoredMessage { message, delivery });
        true
    }
}
