//! HTTP backend for `/health` and `/api/chat`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default per-request timeout for health checks.
pub const HEALTH_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default per-request timeout for chat calls.
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend returned HTTP {status}")]
    Status { status: u16, message: Option<String> },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else if e.is_decode() {
            BackendError::InvalidResponse(e.to_string())
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub context: String,
}

/// Successful `POST /api/chat` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

/// Error body; the backend sends either field.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    fallback: Option<String>,
}

impl ErrorBody {
    fn parse(text: &str) -> Option<String> {
        let body: ErrorBody = serde_json::from_str(text).ok()?;
        let usable = |m: &String| !m.trim().is_empty();
        body.message.filter(usable).or(body.fallback.filter(usable))
    }
}

/// The remote services the assistant talks to.
#[async_trait]
pub trait Backend: Send + Sync {
    /// `GET /health`. Returns the opaque payload on 2xx.
    async fn health(&self) -> Result<serde_json::Value, BackendError>;

    /// `POST /api/chat` with a bearer token.
    async fn chat(&self, request: &ChatRequest, token: &str) -> Result<ChatResponse, BackendError>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    health_timeout: Duration,
    chat_timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("studylamp/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_timeout: HEALTH_TIMEOUT,
            chat_timeout: CHAT_TIMEOUT,
        })
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_chat_timeout(mut self, timeout: Duration) -> Self {
        self.chat_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn health(&self) -> Result<serde_json::Value, BackendError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: None,
            });
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }

    async fn chat(&self, request: &ChatRequest, token: &str) -> Result<ChatResponse, BackendError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .bearer_auth(token)
            .timeout(self.chat_timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: ErrorBody::parse(&text),
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }
}
