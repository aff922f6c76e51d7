#![allow(clippy::unwrap_used, clippy::expect_used, clippy::doc_markdown)]

//! Integration tests for history pagination through `AreaConversation`.
//!
//! Verifies:
//! 1. Walking back pages loads all history exactly once, in order.
//! 2. Concurrent "load older" requests share one backend fetch.
//! 3. A failed page leaves loaded messages untouched and can be retried.
//! 4. Live arrivals during pagination never duplicate or reorder entries.
//! 5. Closing the conversation abandons an in-flight load.

use std::sync::Arc;
use std::time::Duration;

use areachat::backend::BackendError;
use areachat::backend::memory::InMemoryBackend;
use areachat::chat::pagination::PaginationError;
use areachat::conversation::{AreaConversation, AreaTarget, ConversationConfig, Participant};
use areachat::transport::Channel;
use areachat::transport::loopback::{self, LoopbackChannel, LoopbackListener};
use areachat_proto::event::{InboundEvent, RawMessage};
use areachat_proto::frame::{self, ClientFrame, ControlFrame, ServerFrame};
use areachat_proto::message::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const T0: u64 = 1_714_557_600_000;

fn area() -> AreaRef {
    AreaRef::new("t1", "general")
}

fn ana() -> Author {
    Author {
        user_id: Some(UserId::new("u1")),
        display_name: "Ana".into(),
        avatar_url: None,
    }
}

fn target() -> AreaTarget {
    AreaTarget {
        area: area(),
        user: Participant {
            user_id: UserId::new("u1"),
            display_name: "Ana".into(),
        },
        token: Some("tok".into()),
    }
}

fn message(i: u64) -> Message {
    Message {
        id: MessageId::new(format!("m-{i:03}")),
        author: ana(),
        body: format!("mensaje {i}"),
        kind: MessageKind::Text,
        created_at: Timestamp::from_millis(T0 + i * 60_000),
        edited_at: None,
        provenance: Provenance::Web,
        telegram: None,
        client_nonce: None,
        timestamp_estimated: false,
    }
}

fn seeded(count: u64) -> InMemoryBackend {
    let backend = InMemoryBackend::new(ana());
    backend.seed(&area(), (0..count).map(message));
    backend
}

async fn open(
    backend: InMemoryBackend,
) -> (
    Arc<AreaConversation<InMemoryBackend>>,
    LoopbackChannel,
    LoopbackListener,
) {
    let (connector, mut listener) = loopback::endpoint(64);
    let server = tokio::spawn(async move {
        let channel = listener.accept().await.unwrap();
        let auth = frame::decode_client(&channel.recv().await.unwrap()).unwrap();
        assert!(matches!(auth, ClientFrame::Auth { .. }));
        let ok = ControlFrame::AuthOk { session_id: None };
        channel
            .send(frame::encode_server(&ok.into()).unwrap())
            .await
            .unwrap();
        (channel, listener)
    });
    let (conversation, _events) =
        AreaConversation::open(target(), connector, backend, ConversationConfig::default())
            .await
            .unwrap();
    let (channel, listener) = server.await.unwrap();
    (Arc::new(conversation), channel, listener)
}

fn ids(conversation: &AreaConversation<InMemoryBackend>) -> Vec<String> {
    conversation
        .ordered()
        .iter()
        .map(|e| e.message.id.to_string())
        .collect()
}

fn assert_sorted_unique(conversation: &AreaConversation<InMemoryBackend>) {
    let entries = conversation.ordered();
    let mut seen = std::collections::HashSet::new();
    for entry in &entries {
        assert!(seen.insert(entry.message.id.clone()), "duplicate {}", entry.message.id);
    }
    for pair in entries.windows(2) {
        assert!(pair[0].message.order_key() < pair[1].message.order_key());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn walking_back_loads_everything_once() {
    let backend = seeded(120);
    let (conversation, _channel, _listener) = open(backend.clone()).await;
    assert_eq!(conversation.ordered().len(), 50);
    assert!(conversation.has_more());

    let second = conversation.load_older().await.unwrap();
    assert_eq!((second.fetched, second.inserted, second.has_more), (50, 50, true));

    let third = conversation.load_older().await.unwrap();
    assert_eq!((third.fetched, third.inserted, third.has_more), (20, 20, false));
    assert!(!conversation.has_more());

    // Exhausted: no further I/O.
    let calls = backend.history_calls();
    let done = conversation.load_older().await.unwrap();
    assert_eq!(done.fetched, 0);
    assert_eq!(backend.history_calls(), calls);

    let expected: Vec<_> = (0..120).map(|i| format!("m-{i:03}")).collect();
    assert_eq!(ids(&conversation), expected);
    assert!(conversation.starts_new_day(0));
}

#[tokio::test]
async fn concurrent_requests_share_one_fetch() {
    let backend = seeded(120);
    let (conversation, _channel, _listener) = open(backend.clone()).await;
    backend.set_history_delay(Some(Duration::from_millis(100)));
    let before = backend.history_calls();

    let (a, b, c) = tokio::join!(
        conversation.load_older(),
        conversation.load_older(),
        conversation.load_older()
    );
    assert_eq!(backend.history_calls(), before + 1);
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(a.unwrap().inserted, 50);
    assert_eq!(conversation.ordered().len(), 100);
    assert_sorted_unique(&conversation);
}

#[tokio::test]
async fn failed_page_leaves_store_untouched_and_retries() {
    let backend = seeded(80);
    let (conversation, _channel, _listener) = open(backend.clone()).await;
    let loaded = ids(&conversation);

    backend.fail_history(Some(BackendError::Network("connection reset".into())));
    let err = conversation.load_older().await.unwrap_err();
    assert_eq!(
        err,
        PaginationError::Backend(BackendError::Network("connection reset".into()))
    );
    assert_eq!(ids(&conversation), loaded);
    assert!(conversation.has_more());

    backend.fail_history(None);
    let retry = conversation.load_older().await.unwrap();
    assert_eq!(retry.inserted, 30);
    assert_eq!(conversation.ordered().len(), 80);
}

#[tokio::test]
async fn failed_initial_load_can_be_retried() {
    let backend = seeded(10);
    backend.fail_history(Some(BackendError::Timeout));
    let (conversation, _channel, _listener) = open(backend.clone()).await;
    assert!(conversation.ordered().is_empty());

    backend.fail_history(None);
    let page = conversation.load_older().await.unwrap();
    assert_eq!(page.inserted, 10);
    assert!(!conversation.has_more());
}

#[tokio::test]
async fn live_arrivals_during_pagination_do_not_duplicate() {
    let backend = seeded(120);
    let (conversation, channel, _listener) = open(backend.clone()).await;
    backend.set_history_delay(Some(Duration::from_millis(100)));

    let loader = {
        let conversation = Arc::clone(&conversation);
        tokio::spawn(async move { conversation.load_older().await })
    };

    // A brand-new message plus a re-delivery of one already loaded.
    for i in [200, 119] {
        let event = InboundEvent::MessageCreated {
            message: RawMessage::from(&message(i)),
        };
        channel
            .send(frame::encode_server(&ServerFrame::Event(event)).unwrap())
            .await
            .unwrap();
    }

    loader.await.unwrap().unwrap();
    for _ in 0..100 {
        if conversation.ordered().len() == 101 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(conversation.ordered().len(), 101);
    assert_eq!(ids(&conversation).last().map(String::as_str), Some("m-200"));
    assert_sorted_unique(&conversation);

    // The boundary is the oldest confirmed message, unaffected by the live one.
    let next = conversation.load_older().await.unwrap();
    assert_eq!(next.inserted, 20);
    assert_sorted_unique(&conversation);
}

#[tokio::test]
async fn close_abandons_in_flight_load() {
    let backend = seeded(120);
    let (conversation, _channel, _listener) = open(backend.clone()).await;
    backend.set_history_delay(Some(Duration::from_millis(200)));

    let loader = {
        let conversation = Arc::clone(&conversation);
        tokio::spawn(async move { conversation.load_older().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    conversation.close();

    assert_eq!(loader.await.unwrap(), Err(PaginationError::Closed));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(conversation.ordered().len(), 50);
    assert_eq!(
        conversation.load_older().await,
        Err(PaginationError::Closed)
    );
}
