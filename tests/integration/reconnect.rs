#![allow(clippy::unwrap_used, clippy::expect_used, clippy::doc_markdown)]

//! Integration tests for the channel lifecycle.
//!
//! Verifies:
//! 1. A dropped channel reconnects and missed messages are recovered by
//!    catching up on history.
//! 2. The view sees `Reconnecting` then `Connected`.
//! 3. A refused handshake is fatal, both at open and on reconnect.
//! 4. A missing credential fails without any I/O.
//! 5. An unreachable server at open is retried in the background.
//! 6. Closing the conversation stops reconnect attempts.
//! 7. A refusal is never lost to a full view buffer.

use std::time::Duration;

use areachat::backend::memory::InMemoryBackend;
use areachat::config::{ChatConfig, ReconnectConfig};
use areachat::connection::backoff::Jitter;
use areachat::connection::{ConnectError, ConnectionState};
use areachat::conversation::{
    AreaConversation, AreaTarget, ConversationConfig, ConversationError, ConversationEvent,
    Participant,
};
use areachat::transport::Channel;
use areachat::transport::loopback::{self, LoopbackChannel, LoopbackListener};
use areachat_proto::event::InboundEvent;
use areachat_proto::frame::{self, AuthErrorCode, ClientFrame, ControlFrame, ServerFrame};
use areachat_proto::message::*;
use tokio::sync::mpsc;

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

fn target(token: Option<&str>) -> AreaTarget {
    AreaTarget {
        area: area(),
        user: Participant {
            user_id: UserId::new("u1"),
            display_name: "Ana".into(),
        },
        token: token.map(Into::into),
    }
}

fn fast_config() -> ConversationConfig {
    ConversationConfig {
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: Jitter::None,
            ..ReconnectConfig::default()
        },
        ..ConversationConfig::default()
    }
}

fn history(range: std::ops::Range<u64>) -> Vec<Message> {
    range
        .map(|i| Message {
            id: MessageId::new(format!("m-{i:02}")),
            author: ana(),
            body: format!("mensaje {i}"),
            kind: MessageKind::Text,
            created_at: Timestamp::from_millis(T0 + i * 1_000),
            edited_at: None,
            provenance: Provenance::Web,
            telegram: None,
            client_nonce: None,
            timestamp_estimated: false,
        })
        .collect()
}

async fn reply(channel: &LoopbackChannel, control: ControlFrame) {
    let text = frame::encode_server(&ServerFrame::Control(control)).unwrap();
    channel.send(text).await.unwrap();
}

/// Accept the next channel and answer its auth frame.
async fn accept(listener: &mut LoopbackListener, answer: ControlFrame) -> LoopbackChannel {
    let channel = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no connection attempt")
        .unwrap();
    let auth = frame::decode_client(&channel.recv().await.unwrap()).unwrap();
    assert!(matches!(auth, ClientFrame::Auth { .. }));
    reply(&channel, answer).await;
    channel
}

fn ok() -> ControlFrame {
    ControlFrame::AuthOk { session_id: None }
}

fn refused() -> ControlFrame {
    ControlFrame::AuthError {
        code: AuthErrorCode::Unauthorized,
        reason: "token expired".into(),
    }
}

async fn open_with(
    backend: InMemoryBackend,
    config: ConversationConfig,
) -> (
    AreaConversation<InMemoryBackend>,
    mpsc::Receiver<ConversationEvent>,
    LoopbackChannel,
    LoopbackListener,
    loopback::LoopbackConnector,
) {
    let (connector, mut listener) = loopback::endpoint(64);
    let probe = connector.clone();
    let server = tokio::spawn(async move {
        let channel = accept(&mut listener, ok()).await;
        (channel, listener)
    });
    let (conversation, events) = AreaConversation::open(target(Some("tok")), connector, backend, config)
        .await
        .unwrap();
    let (channel, listener) = server.await.unwrap();
    (conversation, events, channel, listener, probe)
}

async fn next_connection_change(events: &mut mpsc::Receiver<ConversationEvent>) -> ConversationEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches!(
                event,
                ConversationEvent::ConnectionChanged(_) | ConversationEvent::ConnectionLost(_)
            ) {
                return event;
            }
        }
    })
    .await
    .expect("no connection event")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_recovers_messages_missed_while_down() {
    let backend = InMemoryBackend::new(ana());
    backend.seed(&area(), history(0..3));
    let (conversation, mut events, channel, mut listener, _probe) =
        open_with(backend.clone(), fast_config()).await;
    assert_eq!(conversation.ordered().len(), 3);
    assert_eq!(
        next_connection_change(&mut events).await,
        ConversationEvent::ConnectionChanged(ConnectionState::Connected)
    );

    // The channel drops; two messages are posted while the client is away.
    channel.close();
    backend.seed(&area(), history(3..5));
    assert_eq!(
        next_connection_change(&mut events).await,
        ConversationEvent::ConnectionChanged(ConnectionState::Reconnecting)
    );

    let _second = accept(&mut listener, ok()).await;
    assert_eq!(
        next_connection_change(&mut events).await,
        ConversationEvent::ConnectionChanged(ConnectionState::Connected)
    );

    wait_until(|| conversation.ordered().len() == 5).await;
    let ids: Vec<_> = conversation
        .ordered()
        .iter()
        .map(|e| e.message.id.to_string())
        .collect();
    assert_eq!(ids, vec!["m-00", "m-01", "m-02", "m-03", "m-04"]);
    assert!(conversation.can_send());
}

#[tokio::test]
async fn live_events_resume_on_the_new_channel() {
    let (conversation, _events, channel, mut listener, _probe) =
        open_with(InMemoryBackend::new(ana()), fast_config()).await;

    channel.close();
    let second = accept(&mut listener, ok()).await;
    wait_until(|| conversation.connection_state() == ConnectionState::Connected).await;

    let event = InboundEvent::MessageCreated {
        message: (&history(7..8)[0]).into(),
    };
    second
        .send(frame::encode_server(&ServerFrame::Event(event)).unwrap())
        .await
        .unwrap();
    wait_until(|| conversation.ordered().len() == 1).await;
}

#[tokio::test]
async fn refused_reauthentication_is_fatal() {
    let (conversation, mut events, channel, mut listener, probe) =
        open_with(InMemoryBackend::new(ana()), fast_config()).await;
    next_connection_change(&mut events).await;

    channel.close();
    let _refused = accept(&mut listener, refused()).await;

    let lost = loop {
        if let ConversationEvent::ConnectionLost(reason) = next_connection_change(&mut events).await {
            break reason;
        }
    };
    assert!(lost.contains("token expired"));
    assert_eq!(conversation.connection_state(), ConnectionState::Disconnected);

    // No further attempts after a fatal refusal.
    let attempts = probe.open_count();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(probe.open_count(), attempts);
}

#[tokio::test]
async fn refused_handshake_fails_open() {
    let (connector, mut listener) = loopback::endpoint(8);
    tokio::spawn(async move {
        let _channel = accept(&mut listener, refused()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let result = AreaConversation::open(
        target(Some("tok")),
        connector,
        InMemoryBackend::new(ana()),
        fast_config(),
    )
    .await;
    assert!(matches!(
        result,
        Err(ConversationError::Connect(ConnectError::Rejected {
            code: AuthErrorCode::Unauthorized,
            ..
        }))
    ));
}

#[tokio::test]
async fn missing_credential_fails_without_io() {
    let (connector, _listener) = loopback::endpoint(8);
    let probe = connector.clone();
    let backend = InMemoryBackend::new(ana());

    let result = AreaConversation::open(target(None), connector, backend.clone(), fast_config()).await;
    assert!(matches!(
        result,
        Err(ConversationError::Connect(ConnectError::MissingCredential))
    ));
    assert_eq!(probe.open_count(), 0);
    assert_eq!(backend.history_calls(), 0);
}

#[tokio::test]
async fn unreachable_at_open_keeps_retrying() {
    let (connector, mut listener) = loopback::endpoint(8);
    connector.fail_next_opens(3);
    let probe = connector.clone();
    let server = tokio::spawn(async move {
        let channel = accept(&mut listener, ok()).await;
        (channel, listener)
    });

    let (conversation, _events) = AreaConversation::open(
        target(Some("tok")),
        connector,
        InMemoryBackend::new(ana()),
        fast_config(),
    )
    .await
    .unwrap();
    assert_ne!(conversation.connection_state(), ConnectionState::Connected);

    let _server = server.await.unwrap();
    wait_until(|| conversation.connection_state() == ConnectionState::Connected).await;
    assert_eq!(probe.open_count(), 4);
}

#[tokio::test]
async fn close_stops_reconnecting() {
    let (conversation, _events, channel, _listener, probe) =
        open_with(InMemoryBackend::new(ana()), fast_config()).await;

    conversation.close();
    channel.close();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(probe.open_count(), 1);
    assert_eq!(conversation.connection_state(), ConnectionState::Disconnected);
    assert!(!conversation.can_send());
}

#[tokio::test]
async fn refusal_survives_a_full_view_buffer() {
    let config = ConversationConfig {
        chat: ChatConfig {
            event_buffer: 1,
            ..ChatConfig::default()
        },
        ..fast_config()
    };
    let (conversation, mut events, channel, mut listener, _probe) =
        open_with(InMemoryBackend::new(ana()), config).await;

    // The view is not draining; the buffer already holds `Connected`.
    channel.close();
    let _refused = accept(&mut listener, refused()).await;
    wait_until(|| conversation.connection_lost().is_some()).await;
    assert!(conversation.connection_lost().unwrap().contains("token expired"));

    let lost = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ConversationEvent::ConnectionLost(reason) = events.recv().await.unwrap() {
                break reason;
            }
        }
    })
    .await
    .expect("refusal never delivered");
    assert!(lost.contains("token expired"));
}
