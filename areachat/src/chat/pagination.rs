//! "Load older" paging and reconnect catch-up.
//!
//! The controller fetches pages from a [`ChatBackend`] and merges them into a
//! [`PageSink`] (the conversation's store). Concurrent requests for the same
//! boundary share one fetch through a [`Shared`] future. Every continuation
//! checks that the sink is still alive before merging, and
//! [`PaginationController::cancel_all`] aborts whatever is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;

use areachat_proto::api::HistoryPage;
use areachat_proto::message::{AreaRef, Message, MessageId, Timestamp};

use crate::backend::{BackendError, ChatBackend};
use crate::chat::reconcile::normalize;

/// Where fetched pages land.
pub trait PageSink: Send + Sync + 'static {
    /// Whether results may still be applied.
    fn is_alive(&self) -> bool;

    /// Whether older history may still exist.
    fn has_more(&self) -> bool;

    /// Merge a page of older history and set the boundary flag.
    /// Returns how many entries were added.
    fn merge_older(&self, messages: Vec<Message>, has_more: bool) -> usize;

    /// Merge a page fetched during catch-up. Returns how many entries were
    /// added, and whether the page overlapped what was already known (an
    /// empty store counts as overlap).
    fn merge_latest(&self, messages: Vec<Message>) -> (usize, bool);
}

/// Errors from a page load.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaginationError {
    /// The backend failed; already-loaded messages are untouched.
    #[error("could not load history: {0}")]
    Backend(BackendError),

    /// The conversation was closed while the request was in flight.
    #[error("conversation closed")]
    Closed,
}

/// Result of one `load_older` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOutcome {
    /// Records returned by the backend.
    pub fetched: usize,
    /// Entries actually added to the store.
    pub inserted: usize,
    /// Whether older history may still exist.
    pub has_more: bool,
}

/// Result of a reconnect catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUp {
    /// Pages fetched.
    pub pages: usize,
    /// Entries added to the store.
    pub inserted: usize,
    /// Whether the walk stopped at the page limit without finding overlap.
    pub possible_gap: bool,
}

type PageFuture = Shared<BoxFuture<'static, Result<PageOutcome, PaginationError>>>;

/// Drives history loading for one area.
pub struct PaginationController<B, S> {
    backend: Arc<B>,
    sink: Arc<S>,
    area: AreaRef,
    page_size: usize,
    max_recovery_pages: usize,
    inflight: Arc<Mutex<HashMap<Option<MessageId>, (u64, PageFuture)>>>,
    generation: Arc<AtomicU64>,
    cancelled: Arc<watch::Sender<bool>>,
}

impl<B, S> Clone for PaginationController<B, S> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            sink: Arc::clone(&self.sink),
            area: self.area.clone(),
            page_size: self.page_size,
            max_recovery_pages: self.max_recovery_pages,
            inflight: Arc::clone(&self.inflight),
            generation: Arc::clone(&self.generation),
            cancelled: Arc::clone(&self.cancelled),
        }
    }
}

impl<B: ChatBackend, S: PageSink> PaginationController<B, S> {
    /// Create a controller. A `page_size` of zero is treated as one.
    pub fn new(
        backend: Arc<B>,
        sink: Arc<S>,
        area: AreaRef,
        page_size: usize,
        max_recovery_pages: usize,
    ) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            backend,
            sink,
            area,
            page_size: page_size.max(1),
            max_recovery_pages: max_recovery_pages.max(1),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(cancelled),
        }
    }

    /// Load the page strictly older than `before`, or the newest page when
    /// `before` is `None`.
    ///
    /// Concurrent calls for the same boundary share one fetch and all see
    /// the same outcome. Once history is exhausted, calls with a boundary
    /// return immediately without I/O.
    ///
    /// # Errors
    ///
    /// [`PaginationError::Backend`] if the fetch fails and
    /// [`PaginationError::Closed`] after [`cancel_all`](Self::cancel_all).
    pub async fn load_older(
        &self,
        before: Option<MessageId>,
    ) -> Result<PageOutcome, PaginationError> {
        if *self.cancelled.borrow() {
            return Err(PaginationError::Closed);
        }
        if before.is_some() && !self.sink.has_more() {
            return Ok(PageOutcome {
                fetched: 0,
                inserted: 0,
                has_more: false,
            });
        }

        let shared = {
            let mut inflight = self.inflight.lock();
            if let Some((_, existing)) = inflight.get(&before) {
                tracing::debug!(
                    area = %self.area,
                    before = before.as_ref().map_or("-", MessageId::as_str),
                    "joining in-flight page load"
                );
                existing.clone()
            } else {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let this = self.clone();
                let key = before.clone();
                let future = async move {
                    let result = this.fetch_older(key.as_ref()).await;
                    this.finish(&key, generation);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(before, (generation, future.clone()));
                future
            }
        };
        shared.await
    }

    /// Re-sync after a reconnect: merge the newest page, then walk older
    /// pages until one overlaps known messages, history ends, or the page
    /// limit is hit.
    ///
    /// # Errors
    ///
    /// [`PaginationError::Backend`] if a fetch fails and
    /// [`PaginationError::Closed`] if the conversation closes meanwhile.
    pub async fn catch_up(&self) -> Result<CatchUp, PaginationError> {
        let mut before: Option<MessageId> = None;
        let mut pages = 0;
        let mut inserted = 0;

        loop {
            let page = self.fetch(before.as_ref()).await?;
            pages += 1;
            let more_upstream = page.has_more && page.messages.len() >= self.page_size;
            let messages = normalize_page(&page);
            let oldest = messages.iter().min_by(|a, b| a.order_key().cmp(&b.order_key()));
            let next_before = oldest.map(|m| m.id.clone());

            let (added, overlapped) = self.sink.merge_latest(messages);
            inserted += added;

            if overlapped || !more_upstream || next_before.is_none() {
                tracing::debug!(area = %self.area, pages, inserted, "catch-up complete");
                return Ok(CatchUp {
                    pages,
                    inserted,
                    possible_gap: false,
                });
            }
            if pages >= self.max_recovery_pages {
                tracing::warn!(
                    area = %self.area,
                    pages,
                    inserted,
                    "catch-up page limit reached without overlap, messages may be missing"
                );
                return Ok(CatchUp {
                    pages,
                    inserted,
                    possible_gap: true,
                });
            }
            before = next_before;
        }
    }

    /// Abort every in-flight load. Later calls fail with `Closed`.
    pub fn cancel_all(&self) {
        self.cancelled.send_replace(true);
        self.inflight.lock().clear();
    }

    /// Number of distinct boundaries currently being fetched.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }

    async fn fetch_older(&self, before: Option<&MessageId>) -> Result<PageOutcome, PaginationError> {
        let page = self.fetch(before).await?;
        let fetched = page.messages.len();
        let has_more = page.has_more && fetched >= self.page_size;
        let inserted = self.sink.merge_older(normalize_page(&page), has_more);
        tracing::debug!(area = %self.area, fetched, inserted, has_more, "older page merged");
        Ok(PageOutcome {
            fetched,
            inserted,
            has_more,
        })
    }

    /// One backend round trip, abandoned on cancellation, with a liveness
    /// check before the result is handed back for merging.
    async fn fetch(&self, before: Option<&MessageId>) -> Result<HistoryPage, PaginationError> {
        let mut cancelled = self.cancelled.subscribe();
        let page = tokio::select! {
            result = self.backend.fetch_history(&self.area, before, self.page_size) => {
                result.map_err(PaginationError::Backend)?
            }
            _ = cancelled.wait_for(|c| *c) => return Err(PaginationError::Closed),
        };
        if !self.sink.is_alive() || *self.cancelled.borrow() {
            return Err(PaginationError::Closed);
        }
        Ok(page)
    }

    fn finish(&self, key: &Option<MessageId>, generation: u64) {
        let mut inflight = self.inflight.lock();
        if inflight.get(key).is_some_and(|(g, _)| *g == generation) {
            inflight.remove(key);
        }
    }
}

fn normalize_page(page: &HistoryPage) -> Vec<Message> {
    let received_at = Timestamp::now();
    page.messages
        .iter()
        .filter_map(|raw| normalize(raw, received_at))
        .collect()
}
