//! Bridge from rig-core's `CompletionModel` to our `LlmProvider` trait.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use rig::completion::{CompletionError, CompletionModel};
use rig::message::AssistantContent;
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::openai_compat::mentions_context_length;
use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};

/// Wraps any rig completion model (Anthropic, OpenAI, ...).
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider: provider.to_string(),
        }
    }
}

static STATUS_429_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bstatus:?\s*429\b|\bhttp\s*429\b|\b429\s+too many|too many requests|rate[ _]limit)")
        .expect("valid regex")
});

static STATUS_401_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bstatus:?\s*40[13]\b|\bhttp\s*40[13]\b|\b40[13]\s+(unauthorized|forbidden)|unauthorized|invalid x-api-key|authentication_error)")
        .expect("valid regex")
});

static STATUS_4XX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bstatus:?\s*4\d\d\b|\bhttp\s*4\d\d\b|\b4\d\d\s+(bad request|not found|unprocessable)|invalid_request_error|bad request)")
        .expect("valid regex")
});

/// Classify a rig error by its rendered message.
///
/// rig flattens provider HTTP failures into strings, so the status code is
/// recovered from the text. Bare numbers (token counts and the like) are
/// never read as a status.
pub(crate) fn map_rig_error(provider: &str, message: &str) -> LlmError {
    let provider = provider.to_string();
    if STATUS_429_RE.is_match(message) {
        LlmError::RateLimited {
            provider,
            retry_after: None,
        }
    } else if STATUS_401_RE.is_match(message) {
        LlmError::AuthFailed { provider }
    } else if mentions_context_length(message) {
        LlmError::ContextLengthExceeded {
            provider,
            reason: message.to_string(),
        }
    } else if STATUS_4XX_RE.is_match(message) {
        LlmError::InvalidRequest {
            provider,
            reason: message.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider,
            reason: message.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut builder = self.model.completion_request(request.user_prompt());
        if let Some(system) = request.system_prompt() {
            builder = builder.preamble(system.to_string());
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder
            .send()
            .await
            .map_err(|e: CompletionError| map_rig_error(&self.provider, &e.to_string()))?;

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.clone(),
                reason: "no text content in response".into(),
            });
        }

        Ok(CompletionResponse {
            content: content.trim().to_string(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_text_maps_to_rate_limited() {
        let err = map_rig_error("anthropic", "ProviderError: HTTP 429 Too Many Requests");
        assert!(err.is_rate_limited());
    }

    #[test]
    fn rate_limit_error_type_maps_to_rate_limited() {
        let err = map_rig_error("anthropic", r#"{"type":"rate_limit_error"}"#);
        assert!(err.is_rate_limited());
    }

    #[test]
    fn unauthorized_maps_to_auth_failed() {
        let err = map_rig_error("openai", "HttpError: 401 Unauthorized");
        assert!(matches!(err, LlmError::AuthFailed { .. }));
    }

    #[test]
    fn token_counts_containing_429_are_not_rate_limits() {
        let err = map_rig_error("anthropic", "ProviderError: prompt used 4290 tokens, stream closed");
        assert!(!err.is_rate_limited());
        assert!(err.is_transient());
    }

    #[test]
    fn bad_request_maps_to_invalid_request() {
        let err = map_rig_error(
            "anthropic",
            r#"ProviderError: HTTP 400 Bad Request {"type":"invalid_request_error"}"#,
        );
        assert!(matches!(err, LlmError::InvalidRequest { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn oversized_prompt_maps_to_context_length() {
        let err = map_rig_error("anthropic", "ProviderError: prompt is too long: 210000 tokens > 200000 maximum");
        assert!(matches!(err, LlmError::ContextLengthExceeded { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn other_errors_are_transient_failures() {
        let err = map_rig_error("openai", "connection reset by peer");
        assert!(err.is_transient());
    }
}
