//! HTTP model client for OpenAI-compatible chat-completion APIs.
//!
//! Transient failures (connection errors, 429, 5xx) are retried with
//! linear backoff up to the configured retry count. JSON completions
//! run a separate repair loop: on extraction or schema failure the
//! model's response and a repair instruction are appended and the call
//! is retried, up to `min(3, retries + 1)` attempts.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LlmError;

use super::json::extract_json_candidate;
use super::{JsonCompletion, JsonSchema, Message, ModelClient, ModelConfig, TextCompletion, Usage};

/// Base delay for linear retry backoff.
const RETRY_BACKOFF_MS: u64 = 500;

/// Wire request for an OpenAI-compatible chat completion.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Model client backed by an OpenAI-compatible HTTP endpoint.
pub struct HttpModelClient {
    api_base: String,
    api_key: Option<String>,
    http_client: Client,
}

impl HttpModelClient {
    /// Creates a client for the given API base URL.
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key,
            http_client: Client::new(),
        }
    }

    /// Creates a client from `DOCFORGE_API_BASE` / `DOCFORGE_API_KEY`.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base = std::env::var("DOCFORGE_API_BASE")
            .map_err(|_| LlmError::MissingApiKey("DOCFORGE_API_BASE not set".to_string()))?;
        let api_key = std::env::var("DOCFORGE_API_KEY").ok();
        Ok(Self::new(api_base, api_key))
    }

    /// Issues one chat completion request without retries.
    async fn request_once(
        &self,
        config: &ModelConfig,
        messages: &[Message],
    ) -> Result<TextCompletion, LlmError> {
        let body = ChatRequest {
            model: &config.model,
            messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };

        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let mut request = self
            .http_client
            .post(&url)
            .timeout(Duration::from_millis(config.timeout_ms))
            .json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    timeout_ms: config.timeout_ms,
                }
            } else {
                LlmError::RequestFailed(e.to_string())
            }
        })?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = response.status();
        if status.as_u16() == 429 {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::RateLimited(message));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::ParseError("response contained no choices".to_string()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(TextCompletion {
            text,
            usage: Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
            latency_ms,
            model: parsed.model.unwrap_or_else(|| config.model.clone()),
        })
    }

    /// Returns true for errors worth retrying.
    fn is_transient(error: &LlmError) -> bool {
        match error {
            LlmError::RequestFailed(_) | LlmError::RateLimited(_) | LlmError::Timeout { .. } => {
                true
            }
            LlmError::ApiError { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete_text(
        &self,
        config: &ModelConfig,
        messages: &[Message],
    ) -> Result<TextCompletion, LlmError> {
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..=config.retries {
            if attempt > 0 {
                let delay = Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64);
                tokio::time::sleep(delay).await;
            }

            match self.request_once(config, messages).await {
                Ok(completion) => return Ok(completion),
                Err(e) if Self::is_transient(&e) => {
                    warn!(
                        model = %config.model,
                        attempt = attempt + 1,
                        error = %e,
                        "Transient model error, retrying"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: config.retries + 1,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn complete_json(
        &self,
        config: &ModelConfig,
        messages: &[Message],
        schema: &JsonSchema,
    ) -> Result<JsonCompletion, LlmError> {
        let attempts = (config.retries + 1).min(3);
        let mut conversation: Vec<Message> = messages.to_vec();
        let mut usage = Usage::default();
        let mut latency_ms = 0u64;
        let mut last_violation = String::new();

        for attempt in 0..attempts {
            let completion = self.complete_text(config, &conversation).await?;
            usage.input_tokens += completion.usage.input_tokens;
            usage.output_tokens += completion.usage.output_tokens;
            latency_ms += completion.latency_ms;

            let failure = match extract_json_candidate(&completion.text) {
                Some(candidate) => match serde_json::from_str::<serde_json::Value>(&candidate) {
                    Ok(parsed) => match schema.validate(&parsed) {
                        Ok(()) => {
                            return Ok(JsonCompletion {
                                parsed,
                                text: completion.text,
                                usage,
                                latency_ms,
                                model: completion.model,
                            });
                        }
                        Err(violations) => violations.join("; "),
                    },
                    Err(e) => format!("invalid JSON: {}", e),
                },
                None => "no JSON object or array found in the response".to_string(),
            };

            debug!(
                schema = %schema.name,
                attempt = attempt + 1,
                failure = %failure,
                "Schema validation failed, issuing repair prompt"
            );
            last_violation = failure.clone();

            conversation.push(Message::assistant(completion.text));
            conversation.push(Message::user(format!(
                "Your previous response was not valid. Problems: {}. \
                 Respond again with ONLY a JSON value matching the '{}' schema:\n{}",
                failure,
                schema.name,
                serde_json::to_string_pretty(&schema.schema).unwrap_or_default()
            )));
        }

        Err(LlmError::SchemaViolation {
            schema: schema.name.clone(),
            violations: last_violation,
        })
    }
}
