//! REST routes: area history, send, delete, Telegram ingestion and the
//! assistant.
//!
//! Every route requires `Authorization: Bearer <token>` naming a configured
//! user. Errors come back as [`ApiError`] bodies.

use std::sync::Arc;

use areachat_proto::api::{
    ApiError, AssistantAnswer, AssistantQuestion, DEFAULT_PAGE_SIZE, HistoryPage, HistoryQuery,
    SendMessageRequest, TelegramRelayRequest,
};
use areachat_proto::event::{InboundEvent, RawMessage, RawTelegram};
use areachat_proto::message::{
    AreaRef, Author, MessageKind, Provenance, TelegramAuthor, UserId, validate_body,
};
use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};

use crate::config::UserEntry;
use crate::gateway::GatewayState;
use crate::store::{DeleteRefusal, Draft};

type SharedState = State<Arc<GatewayState>>;

/// A failed request: status plus reason.
#[derive(Debug)]
pub struct Failure {
    status: StatusCode,
    reason: String,
}

impl Failure {
    fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        (self.status, Json(ApiError { error: self.reason })).into_response()
    }
}

/// The REST routes, ready to merge into the gateway router.
pub fn routes() -> Router<Arc<GatewayState>> {
    Router::new()
        .route(
            "/api/teams/{team}/areas/{area}/messages",
            get(list_messages).post(create_message),
        )
        .route(
            "/api/teams/{team}/areas/{area}/messages/{id}",
            delete(delete_message),
        )
        .route("/api/teams/{team}/areas/{area}/telegram", post(relay_telegram))
        .route("/api/assistant/ask", post(ask_assistant))
}

fn caller<'a>(state: &'a GatewayState, headers: &HeaderMap) -> Result<&'a UserEntry, Failure> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| Failure::new(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
    state
        .authenticate(token.trim())
        .ok_or_else(|| Failure::new(StatusCode::UNAUTHORIZED, "unknown token"))
}

fn known_area(state: &GatewayState, team: String, area: String) -> Result<AreaRef, Failure> {
    let area = AreaRef::new(team, area);
    if state.area_exists(&area) {
        Ok(area)
    } else {
        Err(Failure::new(StatusCode::NOT_FOUND, format!("no area {area}")))
    }
}

async fn list_messages(
    State(state): SharedState,
    Path((team, area)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<HistoryPage>, Failure> {
    caller(&state, &headers)?;
    let area = known_area(&state, team, area)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, state.history_limit_max());

    let page = state
        .history
        .page(&area, query.before.as_deref(), limit)
        .await
        .map_err(|e| Failure::new(StatusCode::NOT_FOUND, e.to_string()))?;
    tracing::debug!(area = %area, count = page.messages.len(), has_more = page.has_more, "history page");
    Ok(Json(page))
}

async fn create_message(
    State(state): SharedState,
    Path((team, area)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<RawMessage>), Failure> {
    let user = caller(&state, &headers)?.clone();
    let area = known_area(&state, team, area)?;
    validate_body(&request.content)
        .map_err(|e| Failure::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let mut draft = Draft::web(&user.id, &user.name, request.content);
    draft.kind = MessageKind::from_tag(&request.kind);
    draft.client_nonce = request.client_nonce;
    let (message, _) = state.history.append(&area, draft).await;
    tracing::info!(area = %area, id = %message.id, author = %user.id, "message created");

    let raw = RawMessage::from(&message);
    state
        .broadcast(
            &area,
            InboundEvent::MessageCreated {
                message: raw.clone(),
            },
            None,
        )
        .await;
    Ok((StatusCode::CREATED, Json(raw)))
}

async fn delete_message(
    State(state): SharedState,
    Path((team, area, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, Failure> {
    let user = caller(&state, &headers)?;
    let requester = UserId::new(user.id.clone());
    let area = known_area(&state, team, area)?;

    match state.history.delete(&area, &id, &requester).await {
        Ok(_) => {
            tracing::info!(area = %area, id = %id, "message deleted");
            state
                .broadcast(
                    &area,
                    InboundEvent::MessageDeleted {
                        message_id: Some(id),
                    },
                    None,
                )
                .await;
            Ok(StatusCode::NO_CONTENT)
        }
        Err(refusal @ DeleteRefusal::NotFound) => {
            Err(Failure::new(StatusCode::NOT_FOUND, refusal.to_string()))
        }
        Err(refusal @ DeleteRefusal::NotAuthor) => {
            Err(Failure::new(StatusCode::FORBIDDEN, refusal.to_string()))
        }
    }
}

async fn relay_telegram(
    State(state): SharedState,
    Path((team, area)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<TelegramRelayRequest>,
) -> Result<(StatusCode, Json<RawMessage>), Failure> {
    caller(&state, &headers)?;
    let area = known_area(&state, team, area)?;
    validate_body(&request.content)
        .map_err(|e| Failure::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let draft = Draft {
        author: Author {
            user_id: None,
            display_name: bridge_name(&request.telegram),
            avatar_url: None,
        },
        body: request.content,
        kind: MessageKind::Text,
        provenance: Provenance::Telegram,
        telegram: Some(TelegramAuthor {
            first_name: request.telegram.from_first_name,
            last_name: request.telegram.from_last_name,
            username: request.telegram.from_username,
        }),
        client_nonce: None,
        id: request.id,
        created_at: request.created_at.and_then(|ts| ts.resolve()),
    };
    let (message, inserted) = state.history.append(&area, draft).await;
    let raw = RawMessage::from(&message);
    if !inserted {
        tracing::debug!(area = %area, id = %message.id, "telegram message already stored");
        return Ok((StatusCode::OK, Json(raw)));
    }

    tracing::info!(area = %area, id = %message.id, "telegram message relayed");
    state
        .broadcast(
            &area,
            InboundEvent::MessageCreated {
                message: raw.clone(),
            },
            None,
        )
        .await;
    Ok((StatusCode::CREATED, Json(raw)))
}

/// Name stored on bridge messages for clients that ignore telegram fields.
fn bridge_name(telegram: &RawTelegram) -> String {
    let first = telegram.from_first_name.as_deref().map(str::trim);
    let last = telegram.from_last_name.as_deref().map(str::trim);
    match (first, last) {
        (Some(f), Some(l)) if !f.is_empty() && !l.is_empty() => format!("{f} {l}"),
        (Some(f), _) if !f.is_empty() => f.to_string(),
        _ => telegram
            .from_username
            .clone()
            .unwrap_or_else(|| "Telegram".to_string()),
    }
}

async fn ask_assistant(
    State(state): SharedState,
    headers: HeaderMap,
    Json(question): Json<AssistantQuestion>,
) -> Result<Json<AssistantAnswer>, Failure> {
    caller(&state, &headers)?;
    if question.question.trim().is_empty() {
        return Err(Failure::new(StatusCode::BAD_REQUEST, "question is empty"));
    }
    tracing::info!(team = %question.team_id, area = %question.area_id, "assistant question");
    Ok(Json(AssistantAnswer {
        answer: state.assistant_reply().to_string(),
        sources: Vec::new(),
    }))
}
