use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::{Board, BoardFilters, Card, StageId};

use super::GatewayError;

/// Header carrying the caller's session id so the server can attribute the
/// change events it emits.
pub const SESSION_HEADER: &str = "x-session-id";

/// Issues stage-change and archive commands to the authoritative server.
///
/// Implementations are stateless request/response wrappers: they apply no
/// business rules and never touch the board store.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    async fn send_stage_change(&self, card_id: &str, dest: &StageId) -> Result<Card, GatewayError>;

    async fn send_archive(&self, card_id: &str) -> Result<(), GatewayError>;
}

/// Full board snapshot fetch, used on load and on resync.
#[async_trait]
pub trait BoardSource: Send + Sync {
    async fn fetch_board(&self, filters: &BoardFilters) -> Result<Board, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct HttpGateway {
    http_client: reqwest::Client,
    api_url: String,
    session_id: String,
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(
        http_client: reqwest::Client,
        api_url: impl Into<String>,
        session_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            session_id: session_id.into(),
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    /// `/api/leads/{card_id}/{action}` with the id percent-encoded as one
    /// path segment.
    fn lead_url(&self, card_id: &str, action: &str) -> Result<reqwest::Url, GatewayError> {
        let invalid = || GatewayError::Transport(format!("invalid api url: {}", self.api_url));
        let mut url = reqwest::Url::parse(&self.api_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(["api", "leads", card_id, action]);
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| {
                if body.is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    body
                }
            });

        Err(GatewayError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl CommandGateway for HttpGateway {
    async fn send_stage_change(&self, card_id: &str, dest: &StageId) -> Result<Card, GatewayError> {
        tracing::debug!(card_id, dest = dest.as_str(), "Sending stage change");

        let response = self
            .http_client
            .post(self.lead_url(card_id, "status")?)
            .header(SESSION_HEADER, &self.session_id)
            .timeout(self.timeout)
            .json(&json!({ "stage": dest }))
            .send()
            .await?;

        let card = Self::check(response).await?.json::<Card>().await?;
        Ok(card)
    }

    async fn send_archive(&self, card_id: &str) -> Result<(), GatewayError> {
        tracing::debug!(card_id, "Sending archive");

        let response = self
            .http_client
            .post(self.lead_url(card_id, "archive")?)
            .header(SESSION_HEADER, &self.session_id)
            .timeout(self.timeout)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl BoardSource for HttpGateway {
    async fn fetch_board(&self, filters: &BoardFilters) -> Result<Board, GatewayError> {
        let response = self
            .http_client
            .get(self.url("/api/board"))
            .query(&filters.to_query())
            .timeout(self.timeout)
            .send()
            .await?;

        let board = Self::check(response).await?.json::<Board>().await?;
        Ok(board)
    }
}
