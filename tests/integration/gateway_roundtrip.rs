#![allow(clippy::unwrap_used, clippy::expect_used, clippy::doc_markdown)]

//! End-to-end tests: real WebSocket and HTTP against the development
//! gateway.
//!
//! Verifies:
//! 1. A send from one member reaches the other live, once, and the sender
//!    ends with a single confirmed entry.
//! 2. A Telegram message relayed through the bridge route reaches everyone
//!    with its Telegram author.
//! 3. Typing from one member shows up for the other.
//! 4. Deletes propagate; non-authors are refused.
//! 5. History pages are walked back over REST.
//! 6. A bad token is refused at open.

use std::sync::Arc;
use std::time::Duration;

use areachat::backend::BackendError;
use areachat::backend::rest::RestBackend;
use areachat::chat::delivery::{DeleteError, SendOutcome};
use areachat::connection::ConnectError;
use areachat::conversation::{
    AreaConversation, AreaTarget, ConversationConfig, ConversationError, Participant,
};
use areachat::transport::ws::WsConnector;
use areachat_gateway::config::UserEntry;
use areachat_gateway::gateway::{GatewayState, start_server_with_state};
use areachat_gateway::store::Draft;
use areachat_proto::frame::AuthErrorCode;
use areachat_proto::message::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Conversation = AreaConversation<RestBackend>;

fn area() -> AreaRef {
    AreaRef::new("t1", "general")
}

async fn start_gateway() -> (String, Arc<GatewayState>) {
    let state = Arc::new(GatewayState::new(
        vec![
            UserEntry::new("tok-ana", "u1", "Ana"),
            UserEntry::new("tok-luis", "u2", "Luis"),
            UserEntry::new("tok-bridge", "bridge", "Telegram bridge"),
        ],
        vec![area()],
    ));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("http://{addr}"), state)
}

async fn join(base: &str, token: &str, user_id: &str, name: &str) -> Result<Conversation, ConversationError> {
    let target = AreaTarget {
        area: area(),
        user: Participant {
            user_id: UserId::new(user_id),
            display_name: name.into(),
        },
        token: Some(token.into()),
    };
    let backend = RestBackend::new(base, Some(token.into()), Duration::from_secs(5)).unwrap();
    let connector = WsConnector::new(format!("{}/ws", base.replace("http://", "ws://")));
    let (conversation, _events) =
        AreaConversation::open(target, connector, backend, ConversationConfig::default()).await?;
    Ok(conversation)
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

async fn wait_for_subscribers(state: &GatewayState, n: usize) {
    for _ in 0..500 {
        if state.subscriber_count(&area()).await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} subscribers");
}

fn bodies(conversation: &Conversation) -> Vec<String> {
    conversation
        .ordered()
        .iter()
        .map(|e| e.message.body.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_reaches_the_other_member_once() {
    let (base, state) = start_gateway().await;
    let ana = join(&base, "tok-ana", "u1", "Ana").await.unwrap();
    let luis = join(&base, "tok-luis", "u2", "Luis").await.unwrap();
    wait_for_subscribers(&state, 2).await;

    let SendOutcome::Sent(id) = ana.send("hola Luis").await.unwrap() else {
        panic!("expected a sent message");
    };

    wait_until(|| luis.ordered().len() == 1).await;
    let seen = &luis.ordered()[0].message;
    assert_eq!(seen.id, id);
    assert_eq!(seen.author.display_name, "Ana");
    assert_eq!(seen.author.user_id, Some(UserId::new("u1")));

    // Ana got both the REST response and the live echo; one entry remains.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mine = ana.ordered();
    assert_eq!(mine.len(), 1);
    assert!(!mine[0].is_pending());
    assert_eq!(mine[0].message.id, id);
}

#[tokio::test]
async fn telegram_relay_reaches_everyone() {
    let (base, state) = start_gateway().await;
    let ana = join(&base, "tok-ana", "u1", "Ana").await.unwrap();
    wait_for_subscribers(&state, 1).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/api/teams/t1/areas/general/telegram"))
        .bearer_auth("tok-bridge")
        .json(&serde_json::json!({
            "id": "tg-1001",
            "content": "escribo desde Telegram",
            "telegram": {"fromFirstName": "Marta", "fromLastName": "Ruiz", "fromUsername": "mruiz"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    wait_until(|| ana.ordered().len() == 1).await;
    let message = &ana.ordered()[0].message;
    assert_eq!(message.id.as_str(), "tg-1001");
    assert_eq!(message.provenance, Provenance::Telegram);
    assert_eq!(message.author.display_name, "Marta Ruiz");
    assert_eq!(message.author.user_id, None);
    assert_eq!(
        message.telegram.as_ref().and_then(|t| t.username.as_deref()),
        Some("mruiz")
    );
}

#[tokio::test]
async fn typing_shows_up_for_the_other_member() {
    let (base, state) = start_gateway().await;
    let ana = join(&base, "tok-ana", "u1", "Ana").await.unwrap();
    let luis = join(&base, "tok-luis", "u2", "Luis").await.unwrap();
    wait_for_subscribers(&state, 2).await;

    luis.mark_typing();
    wait_until(|| ana.typing_display_names() == vec!["Luis".to_string()]).await;
    assert!(luis.typing_display_names().is_empty());

    luis.mark_stopped();
    wait_until(|| ana.typing_display_names().is_empty()).await;
}

#[tokio::test]
async fn deletes_propagate_and_are_author_only() {
    let (base, state) = start_gateway().await;
    let ana = join(&base, "tok-ana", "u1", "Ana").await.unwrap();
    let luis = join(&base, "tok-luis", "u2", "Luis").await.unwrap();
    wait_for_subscribers(&state, 2).await;

    let SendOutcome::Sent(id) = ana.send("borrador").await.unwrap() else {
        panic!("expected a sent message");
    };
    wait_until(|| luis.ordered().len() == 1).await;

    assert_eq!(
        luis.delete(&id).await,
        Err(DeleteError::Backend(BackendError::Forbidden))
    );
    assert_eq!(ana.ordered().len(), 1);

    ana.delete(&id).await.unwrap();
    assert!(ana.ordered().is_empty());
    wait_until(|| luis.ordered().is_empty()).await;
}

#[tokio::test]
async fn history_is_paged_over_rest() {
    let (base, state) = start_gateway().await;
    for i in 0..60 {
        state
            .history
            .append(&area(), Draft::web("u2", "Luis", format!("viejo {i:02}")))
            .await;
    }

    let ana = join(&base, "tok-ana", "u1", "Ana").await.unwrap();
    assert_eq!(ana.ordered().len(), 50);
    assert!(ana.has_more());
    assert_eq!(bodies(&ana)[0], "viejo 10");

    let page = ana.load_older().await.unwrap();
    assert_eq!((page.fetched, page.inserted, page.has_more), (10, 10, false));
    let expected: Vec<_> = (0..60).map(|i| format!("viejo {i:02}")).collect();
    assert_eq!(bodies(&ana), expected);
}

#[tokio::test]
async fn assistant_answers_over_rest() {
    let (base, _state) = start_gateway().await;
    let ana = join(&base, "tok-ana", "u1", "Ana").await.unwrap();

    let outcome = ana.send("/ia ¿hay reunión hoy?").await.unwrap();
    assert!(matches!(outcome, SendOutcome::Answered(ref a) if !a.answer.is_empty()));
    assert!(ana.ordered().is_empty());
}

#[tokio::test]
async fn bad_token_is_refused_at_open() {
    let (base, _state) = start_gateway().await;
    let result = join(&base, "tok-wrong", "u1", "Ana").await;
    assert!(matches!(
        result,
        Err(ConversationError::Connect(ConnectError::Rejected {
            code: AuthErrorCode::Unauthorized,
            ..
        }))
    ));
}
