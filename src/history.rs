#![forbid(unsafe_code)]

// Message history - reads back persisted chat messages

use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// One persisted chat message as returned by `/api/messages/recent`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(default)]
    pub id: Option<i64>,
    pub content: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

pub struct HistoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl HistoryClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// GET /api/messages/recent with bearer auth.
    pub async fn recent(&self, token: &str, limit: Option<usize>) -> Result<Vec<StoredMessage>, HistoryError> {
        let mut request = self
            .http
            .get(format!("{}/api/messages/recent", self.base_url))
            .header(AUTHORIZATION, format!("Bearer {token}"));
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }

        let resp = request.send().await?;
        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(HistoryError::Unauthorized),
            status if !status.is_success() => Err(HistoryError::Status(status.as_u16())),
            _ => {
                let messages: Vec<StoredMessage> = resp.json().await?;
                debug!("Fetched {} recent messages", messages.len());
                Ok(messages)
            }
        }
    }

    /// True if any recent message contains `marker`.
    pub async fn contains(&self, token: &str, marker: &str) -> Result<bool, HistoryError> {
        let messages = self.recent(token, None).await?;
        Ok(messages.iter().any(|m| m.content.contains(marker)))
    }
}
