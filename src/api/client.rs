//! HTTP client for the chat REST endpoints
//!
//! Wraps reqwest::Client with base URL handling and optional bearer auth.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::config::Config;
use crate::models::{ChatMessage, OutgoingMessage};

/// History endpoints answer either a bare array or a `{ "messages": [...] }` envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    List(Vec<ChatMessage>),
    Envelope { messages: Vec<ChatMessage> },
}

impl HistoryResponse {
    fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            HistoryResponse::List(messages) => messages,
            HistoryResponse::Envelope { messages } => messages,
        }
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.api_url, config.access_token.clone())
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    fn history_url(&self, bid_id: &str) -> String {
        format!("{}/messages/{}", self.base_url, bid_id)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Post a message to a room. Returns the server's stored copy.
    pub async fn send_message(&self, bid_id: &str, body: &str) -> Result<ChatMessage> {
        let url = self.messages_url();
        tracing::debug!("POST {}", url);

        let payload = OutgoingMessage {
            bid_id,
            content: body,
        };
        let resp = self
            .authorize(self.http.post(&url))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        check_response(resp, &url)
            .await?
            .json()
            .await
            .context("Failed to parse sent message")
    }

    /// Load a room's stored messages, oldest first.
    pub async fn message_history(&self, bid_id: &str) -> Result<Vec<ChatMessage>> {
        let url = self.history_url(bid_id);
        tracing::debug!("GET {}", url);

        let resp = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let body: HistoryResponse = check_response(resp, &url)
            .await?
            .json()
            .await
            .context("Failed to parse message history")?;

        let mut messages = body.into_messages();
        messages.sort_by_key(|m| m.sent_at);
        Ok(messages)
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Set access_token in the bidchat config.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
