// Chat completion client for OpenAI-compatible endpoints (DeepSeek, OpenAI, Ollama, vLLM, etc.)

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

use crate::config::ListenerConfig;
use crate::http_client::build_http_client;

/// Prefixed to every generated reply so continuation chunks can drop it.
pub const REPLY_BANNER: &str = "🤖【AI reply】\n";

pub const NOT_CONFIGURED_REPLY: &str = "❌ Service not configured, please set the API key first";
pub const STILL_THINKING_REPLY: &str = "I'm still thinking, please try again later";
pub const PROCESSING_ERROR_REPLY: &str = "An error occurred while processing the message";
pub const UNAVAILABLE_REPLY: &str = "Service temporarily unavailable, please try again later";

/// Anything that can turn an incoming message into reply text.
///
/// Implementations must not fail: on error they return a displayable fallback.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn reply(&self, message: &str) -> String;
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("API key is not configured")]
    NotConfigured,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected response shape: {0}")]
    Protocol(String),
    #[error("failed to process response: {0}")]
    Processing(String),
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: Box<CompletionError>,
    },
}

impl CompletionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }

    /// User-facing text sent to the peer in place of a real reply.
    pub fn fallback(&self) -> &'static str {
        match self {
            Self::NotConfigured => NOT_CONFIGURED_REPLY,
            Self::Protocol(_) => STILL_THINKING_REPLY,
            Self::Processing(_) => PROCESSING_ERROR_REPLY,
            Self::Timeout(_) | Self::Transport(_) | Self::Exhausted { .. } => UNAVAILABLE_REPLY,
        }
    }

    fn from_reqwest(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Transport(error.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionSettings {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            api_url: config.llm_api_url.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub base_timeout: Duration,
    pub timeout_step: Duration,
    /// Timeouts wait `(1 + attempt) * timeout_backoff_unit` before retrying.
    pub timeout_backoff_unit: Duration,
    pub transport_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_timeout: Duration::from_secs(15),
            timeout_step: Duration::from_secs(5),
            timeout_backoff_unit: Duration::from_secs(1),
            transport_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            retries: config.retries,
            base_timeout: Duration::from_secs(config.base_timeout_secs),
            timeout_step: Duration::from_secs(config.timeout_step_secs),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    pub fn timeout_for(&self, attempt: u32) -> Duration {
        self.base_timeout + self.timeout_step * attempt
    }

    /// Delay before the next attempt, or `None` when the error must not be retried.
    fn backoff_after(&self, error: &CompletionError, attempt: u32) -> Option<Duration> {
        match error {
            CompletionError::Timeout(_) => Some(self.timeout_backoff_unit * (1 + attempt)),
            CompletionError::Transport(_) => Some(self.transport_backoff),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Clone)]
pub struct CompletionClient {
    settings: CompletionSettings,
    policy: RetryPolicy,
    client: reqwest::Client,
}

impl CompletionClient {
    pub fn new(settings: CompletionSettings, policy: RetryPolicy) -> Result<Self> {
        Ok(Self {
            settings,
            policy,
            client: build_http_client(Some(Duration::from_secs(10)))?,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.settings.api_key().is_some()
    }

    /// Ask the remote model for a reply. Never fails: errors map to fallback text.
    pub async fn get_reply(&self, message: &str) -> String {
        match self.complete(message).await {
            Ok(content) => format!("{}{}", REPLY_BANNER, content),
            Err(e) => {
                tracing::error!("Completion failed: {}", e);
                e.fallback().to_string()
            }
        }
    }

    /// Run the retry loop and return the raw model output.
    pub async fn complete(&self, message: &str) -> Result<String, CompletionError> {
        let Some(api_key) = self.settings.api_key() else {
            tracing::error!("API key not set, refusing to send request");
            return Err(CompletionError::NotConfigured);
        };

        let attempts = self.policy.attempts();
        let mut last_error = None;

        for attempt in 0..attempts {
            let timeout = self.policy.timeout_for(attempt);
            tracing::info!(
                "API request attempt #{} (timeout: {:?})",
                attempt + 1,
                timeout
            );

            let error = match self.request_once(api_key, message, timeout).await {
                Ok(content) => return Ok(content),
                Err(e) => e,
            };

            let Some(delay) = self.policy.backoff_after(&error, attempt) else {
                return Err(error);
            };

            if attempt + 1 < attempts {
                tracing::warn!("{}; retrying in {:?}", error, delay);
                sleep(delay).await;
            } else {
                tracing::error!("{}; retry budget exhausted", error);
            }
            last_error = Some(error);
        }

        Err(CompletionError::Exhausted {
            attempts,
            last: Box::new(last_error.unwrap_or(CompletionError::Transport(
                "no attempt was made".to_string(),
            ))),
        })
    }

    async fn request_once(
        &self,
        api_key: &str,
        message: &str,
        timeout: Duration,
    ) -> Result<String, CompletionError> {
        let request = ChatCompletionRequest {
            model: &self.settings.model,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.settings.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: message.to_string(),
                },
            ],
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(self.settings.endpoint())
            .bearer_auth(api_key)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CompletionError::from_reqwest(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(CompletionError::Transport(format!(
                "API returned error {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CompletionError::from_reqwest(e, timeout))?;

        parse_completion(&body)
    }
}

#[async_trait]
impl Responder for CompletionClient {
    async fn reply(&self, message: &str) -> String {
        self.get_reply(message).await
    }
}

/// Invalid JSON is a processing failure; valid JSON without a reply is a protocol failure.
fn parse_completion(body: &str) -> Result<String, CompletionError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| CompletionError::Processing(format!("invalid JSON body: {}", e)))?;

    let completion: ChatCompletionResponse = serde_json::from_value(value)
        .map_err(|_| CompletionError::Protocol(truncate(body, 200)))?;

    completion
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| CompletionError::Protocol(truncate(body, 200)))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
