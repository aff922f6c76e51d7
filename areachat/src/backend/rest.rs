//! HTTP implementation of the backend traits (`reqwest`, JSON).
//!
//! Routes:
//!
//! | Call              | Request                                               |
//! |-------------------|-------------------------------------------------------|
//! | history           | `GET    /api/teams/{team}/areas/{area}/messages`      |
//! | send              | `POST   /api/teams/{team}/areas/{area}/messages`      |
//! | delete            | `DELETE /api/teams/{team}/areas/{area}/messages/{id}` |
//! | assistant         | `POST   /api/assistant/ask`                           |

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use areachat_proto::api::{
    ApiError, AssistantAnswer, AssistantQuestion, HistoryPage, SendMessageRequest,
};
use areachat_proto::event::RawMessage;
use areachat_proto::message::{AreaRef, MessageId};

use super::{Assistant, BackendError, ChatBackend};

/// REST client bound to one backend and one credential.
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl RestBackend {
    /// Build a client for `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Network`] if the URL does not parse or the
    /// HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BackendError::Network(format!("invalid base url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::Network(format!(
                "base url {base_url} cannot carry a path"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        url.set_query(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn messages_url(&self, area: &AreaRef) -> Url {
        self.endpoint(&[
            "api",
            "teams",
            area.team_id.as_str(),
            "areas",
            area.area_id.as_str(),
            "messages",
        ])
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await
    }
}

impl ChatBackend for RestBackend {
    async fn fetch_history(
        &self,
        area: &AreaRef,
        before: Option<&MessageId>,
        limit: usize,
    ) -> Result<HistoryPage, BackendError> {
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }
        let request = self.client.get(self.messages_url(area)).query(&query);
        let page: HistoryPage = read_json(self.execute(request).await?).await?;
        tracing::debug!(
            %area,
            before = before.map_or("-", MessageId::as_str),
            count = page.messages.len(),
            has_more = page.has_more,
            "history page fetched"
        );
        Ok(page)
    }

    async fn send_message(
        &self,
        area: &AreaRef,
        request: &SendMessageRequest,
    ) -> Result<RawMessage, BackendError> {
        let builder = self.client.post(self.messages_url(area)).json(request);
        read_json(self.execute(builder).await?).await
    }

    async fn delete_message(&self, area: &AreaRef, id: &MessageId) -> Result<(), BackendError> {
        let mut url = self.messages_url(area);
        if let Ok(mut path) = url.path_segments_mut() {
            path.push(id.as_str());
        }
        self.execute(self.client.delete(url)).await?;
        Ok(())
    }
}

impl Assistant for RestBackend {
    async fn ask(&self, question: &AssistantQuestion) -> Result<AssistantAnswer, BackendError> {
        let url = self.endpoint(&["api", "assistant", "ask"]);
        read_json(self.execute(self.client.post(url).json(question)).await?).await
    }
}

fn map_transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Network(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(BackendError::Unauthorized),
        StatusCode::FORBIDDEN => Err(BackendError::Forbidden),
        StatusCode::NOT_FOUND => Err(BackendError::NotFound),
        _ => {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&text)
                .map(|e| e.error)
                .unwrap_or(text);
            Err(BackendError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    let bytes = response.bytes().await.map_err(map_transport_error)?;
    serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode(e.to_string()))
}
