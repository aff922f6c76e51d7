#![allow(clippy::unwrap_used, clippy::expect_used, clippy::doc_markdown)]

//! Integration tests for live area synchronization.
//!
//! A scripted server on the loopback transport pushes channel events at an
//! `AreaConversation` backed by the in-memory REST double. Verifies:
//! 1. Web and Telegram messages merge into one chronological view.
//! 2. Duplicate and overlapping deliveries collapse to one entry.
//! 3. Deletes and edit markers from the channel are applied.
//! 4. Remote typing appears, expires, and is cleared on disconnect.
//! 5. Malformed frames are skipped without stopping the stream.
//! 6. Local typing is sent as debounced `typing` frames.

use std::time::Duration;

use areachat::backend::memory::InMemoryBackend;
use areachat::conversation::{
    AreaConversation, AreaTarget, ConversationConfig, ConversationEvent, Participant,
};
use areachat::transport::Channel;
use areachat::transport::loopback::{self, LoopbackChannel, LoopbackListener};
use areachat_proto::event::{InboundEvent, RawAuthor, RawAuthorObject, RawMessage, RawTelegram, RawTimestamp};
use areachat_proto::frame::{self, ClientFrame, ControlFrame, ServerFrame};
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

fn target() -> AreaTarget {
    AreaTarget {
        area: area(),
        user: Participant {
            user_id: UserId::new("u1"),
            display_name: "Ana".into(),
        },
        token: Some("tok-ana".into()),
    }
}

fn web(id: &str, author_id: &str, name: &str, millis: u64, body: &str) -> RawMessage {
    RawMessage {
        id: Some(id.into()),
        content: Some(body.into()),
        author: Some(RawAuthor::Object(RawAuthorObject {
            id: Some(author_id.into()),
            name: Some(name.into()),
            avatar: None,
        })),
        created_at: Some(RawTimestamp::Millis(i64::try_from(millis).unwrap())),
        source: Some("web".into()),
        ..RawMessage::default()
    }
}

fn telegram(id: &str, first: &str, last: &str, millis: u64, body: &str) -> RawMessage {
    RawMessage {
        id: Some(id.into()),
        content: Some(body.into()),
        created_at: Some(RawTimestamp::Millis(i64::try_from(millis).unwrap())),
        source: Some("telegram".into()),
        telegram: Some(RawTelegram {
            from_first_name: Some(first.into()),
            from_last_name: Some(last.into()),
            from_username: None,
        }),
        ..RawMessage::default()
    }
}

/// Server end of the loopback channel.
struct ScriptedServer {
    channel: LoopbackChannel,
    _listener: LoopbackListener,
}

impl ScriptedServer {
    async fn push(&self, event: InboundEvent) {
        let text = frame::encode_server(&ServerFrame::Event(event)).unwrap();
        self.channel.send(text).await.unwrap();
    }

    async fn push_raw(&self, text: &str) {
        self.channel.send(text.to_string()).await.unwrap();
    }

    /// Next non-ping frame from the client.
    async fn next_frame(&self) -> ClientFrame {
        loop {
            let text = tokio::time::timeout(Duration::from_secs(5), self.channel.recv())
                .await
                .expect("no client frame")
                .unwrap();
            match frame::decode_client(&text).unwrap() {
                ClientFrame::Ping => {}
                other => return other,
            }
        }
    }
}

async fn accept_and_auth(listener: &mut LoopbackListener) -> LoopbackChannel {
    let channel = listener.accept().await.unwrap();
    let auth = frame::decode_client(&channel.recv().await.unwrap()).unwrap();
    assert!(matches!(auth, ClientFrame::Auth { ref token, .. } if token == "tok-ana"));
    let ok = ControlFrame::AuthOk {
        session_id: Some("s1".into()),
    };
    channel
        .send(frame::encode_server(&ok.into()).unwrap())
        .await
        .unwrap();
    channel
}

async fn open(
    backend: InMemoryBackend,
) -> (
    AreaConversation<InMemoryBackend>,
    mpsc::Receiver<ConversationEvent>,
    ScriptedServer,
) {
    let (connector, mut listener) = loopback::endpoint(64);
    let server = tokio::spawn(async move {
        let channel = accept_and_auth(&mut listener).await;
        (channel, listener)
    });
    let (conversation, events) =
        AreaConversation::open(target(), connector, backend, ConversationConfig::default())
            .await
            .unwrap();
    let (channel, listener) = server.await.unwrap();
    (
        conversation,
        events,
        ScriptedServer {
            channel,
            _listener: listener,
        },
    )
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

fn ids(conversation: &AreaConversation<InMemoryBackend>) -> Vec<String> {
    conversation
        .ordered()
        .iter()
        .map(|e| e.message.id.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn telegram_before_web_is_shown_chronologically() {
    let (conversation, _events, server) = open(InMemoryBackend::new(ana())).await;

    // The relay delivers the later Telegram message first.
    server
        .push(InboundEvent::MessageCreated {
            message: telegram("tg-1", "Marta", "Ruiz", T0 + 2_000, "desde Telegram"),
        })
        .await;
    server
        .push(InboundEvent::MessageCreated {
            message: web("w-1", "u2", "Luis", T0 + 1_000, "desde la web"),
        })
        .await;

    wait_until(|| conversation.ordered().len() == 2).await;
    assert_eq!(ids(&conversation), vec!["w-1", "tg-1"]);

    let entries = conversation.ordered();
    let tg = &entries[1].message;
    assert_eq!(tg.provenance, Provenance::Telegram);
    assert_eq!(tg.author.display_name, "Marta Ruiz");
    assert_eq!(tg.author.user_id, None);
    assert_eq!(entries[0].message.author.display_name, "Luis");
}

#[tokio::test]
async fn duplicate_and_overlapping_deliveries_collapse() {
    let backend = InMemoryBackend::new(ana());
    backend.seed(
        &area(),
        (0..3u64).map(|i| Message {
            id: MessageId::new(format!("h-{i}")),
            author: ana(),
            body: format!("history {i}"),
            kind: MessageKind::Text,
            created_at: Timestamp::from_millis(T0 + i),
            edited_at: None,
            provenance: Provenance::Web,
            telegram: None,
            client_nonce: None,
            timestamp_estimated: false,
        }),
    );
    let (conversation, _events, server) = open(backend).await;
    assert_eq!(ids(&conversation), vec!["h-0", "h-1", "h-2"]);

    // The newest history record arrives again live, then a new one twice.
    server
        .push(InboundEvent::MessageCreated {
            message: web("h-2", "u1", "Ana", T0 + 2, "history 2"),
        })
        .await;
    for _ in 0..2 {
        server
            .push(InboundEvent::MessageCreated {
                message: web("w-9", "u2", "Luis", T0 + 10_000, "nuevo"),
            })
            .await;
    }

    wait_until(|| conversation.ordered().len() == 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ids(&conversation), vec!["h-0", "h-1", "h-2", "w-9"]);
}

#[tokio::test]
async fn two_messages_with_identical_text_and_time_are_both_kept() {
    let (conversation, _events, server) = open(InMemoryBackend::new(ana())).await;
    for id in ["a", "b"] {
        server
            .push(InboundEvent::MessageCreated {
                message: web(id, "u2", "Luis", T0, "ok"),
            })
            .await;
    }
    wait_until(|| conversation.ordered().len() == 2).await;
    assert_eq!(ids(&conversation), vec!["a", "b"]);
}

#[tokio::test]
async fn remote_delete_and_edit_are_applied() {
    let (conversation, mut events, server) = open(InMemoryBackend::new(ana())).await;
    server
        .push(InboundEvent::MessageCreated {
            message: web("w-1", "u2", "Luis", T0, "primero"),
        })
        .await;
    server
        .push(InboundEvent::MessageCreated {
            message: web("w-2", "u2", "Luis", T0 + 1, "segundo"),
        })
        .await;
    wait_until(|| conversation.ordered().len() == 2).await;

    server
        .push(InboundEvent::MessageEdited {
            message_id: Some("w-2".into()),
            edited_at: Some(RawTimestamp::Millis(i64::try_from(T0 + 5).unwrap())),
        })
        .await;
    server
        .push(InboundEvent::MessageDeleted {
            message_id: Some("w-1".into()),
        })
        .await;
    // Deleting something never seen is a no-op.
    server
        .push(InboundEvent::MessageDeleted {
            message_id: Some("ghost".into()),
        })
        .await;

    wait_until(|| conversation.ordered().len() == 1).await;
    let remaining = &conversation.ordered()[0].message;
    assert_eq!(remaining.id.as_str(), "w-2");
    assert!(remaining.is_edited());
    assert_eq!(remaining.body, "segundo");

    let mut saw_change = false;
    while let Ok(event) = events.try_recv() {
        saw_change |= event == ConversationEvent::MessagesChanged;
    }
    assert!(saw_change);
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let (conversation, _events, server) = open(InMemoryBackend::new(ana())).await;

    server.push_raw("not json at all").await;
    server.push_raw(r#"{"type":"presence:update","userId":"u2"}"#).await;
    server
        .push_raw(r#"{"type":"message:new","message":{"content":"sin id"}}"#)
        .await;
    server
        .push(InboundEvent::MessageCreated {
            message: web("w-1", "u2", "Luis", T0, "válido"),
        })
        .await;

    wait_until(|| conversation.ordered().len() == 1).await;
    assert_eq!(ids(&conversation), vec!["w-1"]);
}

#[tokio::test]
async fn message_without_author_is_anonymous_and_without_time_is_estimated() {
    let (conversation, _events, server) = open(InMemoryBackend::new(ana())).await;
    server
        .push_raw(r#"{"type":"message:new","message":{"_id":"x1","content":"hola"}}"#)
        .await;

    wait_until(|| conversation.ordered().len() == 1).await;
    let message = &conversation.ordered()[0].message;
    assert_eq!(message.author.display_name, "Anónimo");
    assert!(message.timestamp_estimated);
    assert!(!conversation.starts_new_day(0));
}

#[tokio::test(start_paused = true)]
async fn remote_typing_appears_and_expires() {
    let (conversation, mut events, server) = open(InMemoryBackend::new(ana())).await;

    server
        .push(InboundEvent::TypingStarted {
            user_id: Some("u2".into()),
            user_name: Some("Luis".into()),
        })
        .await;
    // The local user's own typing echo is ignored.
    server
        .push(InboundEvent::TypingStarted {
            user_id: Some("u1".into()),
            user_name: Some("Ana".into()),
        })
        .await;

    let shown = loop {
        match events.recv().await.unwrap() {
            ConversationEvent::TypingChanged(names) => break names,
            _ => continue,
        }
    };
    assert_eq!(shown, vec!["Luis".to_string()]);
    assert_eq!(conversation.typing_display_names(), vec!["Luis".to_string()]);

    // No refresh: the entry expires on its own.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(conversation.typing_display_names().is_empty());
}

#[tokio::test]
async fn typing_stop_removes_indicator() {
    let (conversation, _events, server) = open(InMemoryBackend::new(ana())).await;
    server
        .push(InboundEvent::TypingStarted {
            user_id: Some("u2".into()),
            user_name: Some("Luis".into()),
        })
        .await;
    wait_until(|| !conversation.typing_display_names().is_empty()).await;

    server
        .push(InboundEvent::TypingStopped {
            user_id: Some("u2".into()),
        })
        .await;
    wait_until(|| conversation.typing_display_names().is_empty()).await;
}

#[tokio::test]
async fn typing_is_cleared_when_the_channel_drops() {
    let (conversation, _events, server) = open(InMemoryBackend::new(ana())).await;
    server
        .push(InboundEvent::TypingStarted {
            user_id: Some("u2".into()),
            user_name: Some("Luis".into()),
        })
        .await;
    wait_until(|| !conversation.typing_display_names().is_empty()).await;

    server.channel.close();
    wait_until(|| conversation.typing_display_names().is_empty()).await;
}

#[tokio::test]
async fn local_typing_is_sent_and_stopped() {
    let (conversation, _events, server) = open(InMemoryBackend::new(ana())).await;

    conversation.mark_typing();
    assert_eq!(server.next_frame().await, ClientFrame::Typing { is_typing: true });

    // Rapid keystrokes inside the debounce window send nothing new.
    conversation.mark_typing();
    conversation.mark_typing();

    conversation.mark_stopped();
    assert_eq!(server.next_frame().await, ClientFrame::Typing { is_typing: false });
}

#[tokio::test]
async fn closed_conversation_ignores_late_events() {
    let (conversation, _events, server) = open(InMemoryBackend::new(ana())).await;
    conversation.close();
    conversation.close();

    let _ = server
        .channel
        .send(
            frame::encode_server(&ServerFrame::Event(InboundEvent::MessageCreated {
                message: web("late", "u2", "Luis", T0, "tarde"),
            }))
            .unwrap(),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conversation.ordered().is_empty());
    assert!(!conversation.can_send());
}
