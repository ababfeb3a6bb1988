//! OpenAI-compatible chat-completions provider over `reqwest`.
//!
//! Cerebras and OpenRouter both speak this wire format, so one client covers
//! the default primary and secondary backends.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};

/// Cerebras inference endpoint.
pub const CEREBRAS_ENDPOINT: &str = "https://api.cerebras.ai/v1/chat/completions";

/// OpenRouter inference endpoint.
pub const OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Provider for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatProvider {
    name: String,
    endpoint: String,
    model: String,
    api_key: SecretString,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    id: Option<String>,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn request_failed(&self, reason: impl Into<String>) -> LlmError {
        LlmError::RequestFailed {
            provider: self.name.clone(),
            reason: reason.into(),
        }
    }
}

/// Map a non-success HTTP status to the matching `LlmError`.
pub(crate) fn error_for_status(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> LlmError {
    let snippet: String = body.chars().take(300).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("HTTP {s}: {snippet}"),
        },
        s if s.is_client_error() && mentions_context_length(body) => {
            LlmError::ContextLengthExceeded {
                provider: provider.to_string(),
                reason: format!("HTTP {s}: {snippet}"),
            }
        }
        s if s.is_client_error() => LlmError::InvalidRequest {
            provider: provider.to_string(),
            reason: format!("HTTP {s}: {snippet}"),
        },
        s => LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("HTTP {s}: {snippet}"),
        },
    }
}

/// Whether an error body reports an oversized prompt.
pub(crate) fn mentions_context_length(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    [
        "context_length_exceeded",
        "context length",
        "maximum context",
        "context window",
        "prompt is too long",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Parse a `Retry-After` header given in whole seconds.
pub(crate) fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .header("X-Title", "Newsletter Digest")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_failed(format!("transport: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status(&self.name, status, retry_after, &text));
        }

        // OpenRouter answers auth failures with an HTML page and a 200.
        let is_html = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/html"));
        if is_html {
            return Err(LlmError::AuthFailed {
                provider: self.name.clone(),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: self.name.clone(),
            reason: format!("body decode: {e}"),
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| LlmError::InvalidResponse {
            provider: self.name.clone(),
            reason: "no choices in response".into(),
        })?;

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        debug!(
            provider = %self.name,
            model = %self.model,
            latency_ms = started.elapsed().as_millis() as u64,
            input_tokens,
            output_tokens,
            "Completion received"
        );

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default().trim().to_string(),
            input_tokens,
            output_tokens,
            finish_reason: FinishReason::from_wire(choice.finish_reason.as_deref()),
            response_id: parsed.id,
        })
    }
}
