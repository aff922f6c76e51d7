//! Typing presence: who else is typing, and when to tell others we are.
//!
//! [`TypingTracker`] holds remote typing entries with a fixed expiry window,
//! pruned before every read so nothing outlives its window even when the
//! stop signal never arrives. [`TypingDebouncer`] rate-limits the local
//! user's own `typing` frames.
//!
//! Both take the current instant as a parameter; the conversation feeds them
//! from its ticker, and tests drive them directly.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use areachat_proto::message::UserId;

/// How long a typing entry lives without a refresh.
pub const DEFAULT_TYPING_WINDOW: Duration = Duration::from_secs(3);

/// One remote user currently typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    /// Who is typing.
    pub user_id: UserId,
    /// Name to display.
    pub display_name: String,
    /// When the entry lapses without a refresh.
    pub expires_at: Instant,
}

/// Set of users currently typing in an area.
#[derive(Debug)]
pub struct TypingTracker {
    window: Duration,
    local_user: UserId,
    entries: HashMap<UserId, TypingEntry>,
}

impl TypingTracker {
    /// Create a tracker that never reports `local_user`.
    #[must_use]
    pub fn new(local_user: UserId, window: Duration) -> Self {
        Self {
            window,
            local_user,
            entries: HashMap::new(),
        }
    }

    /// Insert or refresh an entry, expiring `window` after `now`.
    ///
    /// Returns whether the visible set changed (new user or new name).
    /// Signals about the local user are ignored.
    pub fn mark_typing(&mut self, user_id: UserId, display_name: String, now: Instant) -> bool {
        if user_id == self.local_user {
            return false;
        }
        let expires_at = now + self.window;
        match self.entries.get_mut(&user_id) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = expires_at;
                if entry.display_name == display_name {
                    false
                } else {
                    entry.display_name = display_name;
                    true
                }
            }
            _ => {
                self.entries.insert(
                    user_id.clone(),
                    TypingEntry {
                        user_id,
                        display_name,
                        expires_at,
                    },
                );
                true
            }
        }
    }

    /// Remove an entry immediately.
    pub fn mark_stopped(&mut self, user_id: &UserId) -> bool {
        self.entries.remove(user_id).is_some()
    }

    /// Drop entries whose window has elapsed. Returns whether any were dropped.
    pub fn prune(&mut self, now: Instant) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries.len() != before
    }

    /// Display names of users typing at `now`, sorted.
    pub fn display_names(&mut self, now: Instant) -> Vec<String> {
        self.prune(now);
        let mut names: Vec<String> = self
            .entries
            .values()
            .map(|e| e.display_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of live entries, unpruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) -> bool {
        let had_any = !self.entries.is_empty();
        self.entries.clear();
        had_any
    }
}

/// What the local user should announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    /// Send `typing {isTyping: true}`.
    Start,
    /// Send `typing {isTyping: false}`.
    Stop,
}

/// Rate limiter for the local user's typing frames.
///
/// The first keystroke emits `Start`; further keystrokes re-emit it at most
/// once per half window so remote entries never lapse while typing goes on.
/// One full window without input emits `Stop`.
#[derive(Debug)]
pub struct TypingDebouncer {
    window: Duration,
    last_emitted: Option<Instant>,
    last_input: Option<Instant>,
}

impl TypingDebouncer {
    /// Create an idle debouncer.
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: None,
            last_input: None,
        }
    }

    /// Whether the local user is currently announced as typing.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.last_emitted.is_some()
    }

    /// Record a keystroke.
    pub fn on_input(&mut self, now: Instant) -> Option<TypingSignal> {
        self.last_input = Some(now);
        match self.last_emitted {
            Some(at) if now.saturating_duration_since(at) < self.window / 2 => None,
            _ => {
                self.last_emitted = Some(now);
                Some(TypingSignal::Start)
            }
        }
    }

    /// Periodic check; emits `Stop` after a window of no input.
    pub fn on_tick(&mut self, now: Instant) -> Option<TypingSignal> {
        let last_input = self.last_input?;
        if self.is_active() && now.saturating_duration_since(last_input) >= self.window {
            return self.stop();
        }
        None
    }

    /// Explicit stop (send, blur). Emits `Stop` only if active.
    pub fn stop(&mut self) -> Option<TypingSignal> {
        self.last_input = None;
        self.last_emitted.take().map(|_| TypingSignal::Stop)
    }
}
