//! Chat-completion provider client.
//!
//! One-shot, non-streaming calls against an OpenAI-compatible
//! `/chat/completions` endpoint. Failures are tagged by kind so the
//! scheduler can apply its retry policy without string-matching.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// A single chat message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Request for a single completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
}

/// Provider-reported usage for one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub tokens: u64,
    pub cost: f64,
}

/// Response from a single completion.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

/// A chat-completion backend. Blocks until the provider returns.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    cost: Option<f64>,
}

/// Classify a non-2xx provider response into an error kind.
///
/// Some providers report throttling as a 4xx with a descriptive body rather
/// than a clean 429, so the message text is checked against `rate|429` too.
pub(crate) fn classify_http_error(status: u16, message: &str) -> LlmError {
    static RATE_RE: OnceLock<Regex> = OnceLock::new();
    let rate_re = RATE_RE.get_or_init(|| Regex::new(r"(?i)rate|429").expect("static regex"));

    if status == 429 || rate_re.is_match(message) {
        return LlmError::RateLimited { retry_after: None };
    }
    if (400..500).contains(&status) {
        return LlmError::InvalidRequest(message.to_string());
    }
    LlmError::ServerError {
        status,
        message: message.to_string(),
    }
}

/// HTTP client for an OpenAI-compatible chat-completion provider.
pub struct HttpProvider {
    base_url: String,
    api_key: SecretString,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .expect("reqwest client"),
        }
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = WireRequest {
            model: &request.model,
            messages: &request.messages,
            stream: false,
            max_tokens: request.max_tokens,
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::TransientNetwork(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let message = resp.text().await.unwrap_or_default();
            let mut err = classify_http_error(status.as_u16(), &message);
            if let LlmError::RateLimited { retry_after: ra } = &mut err {
                *ra = retry_after;
            }
            return Err(err);
        }

        let wire: WireResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response carried no choices".into()))?;

        let usage = wire
            .usage
            .map(|u| Usage {
                tokens: u.total_tokens,
                cost: u.cost.unwrap_or(0.0),
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
            usage,
        })
    }
}
