//! Inference gateway: prompt → provider → typed result, with fallback.
//!
//! Per call:
//! 1. Render the kind's prompt and send it to the primary provider.
//!    Transient errors are retried with bounded, jittered backoff. A
//!    rate-limit signal, an unparseable answer, a non-transient error, or an
//!    exhausted retry budget moves on to the secondary.
//! 2. Send the identical prompt to the secondary, once.
//! 3. If that also fails, return the degraded value for the kind.
//!
//! The gateway never returns an error; every result carries its
//! `InferenceSource`.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::llm::retry::RetryConfig;
use crate::pipeline::parsing::{parse_category, parse_score, parse_summary};
use crate::pipeline::prompts::{PromptSet, PromptVars};
use crate::pipeline::types::{
    Category, CleanedContent, InferenceKind, InferenceResult, InferenceSource, Summary,
};

/// Score used when no provider produced a valid one.
pub const DEGRADED_SCORE: u8 = 3;

/// First bullet of a degraded summary.
pub const DEGRADED_SUMMARY: &str = "Content could not be summarized.";

/// What the gateway is asked about.
#[derive(Debug, Clone, Copy)]
pub struct InferenceInput<'a> {
    pub subject: &'a str,
    pub sender: &'a str,
    pub content: &'a CleanedContent,
    /// Result of the summarize call, fed to later prompts.
    pub summary: Option<&'a Summary>,
}

/// Degraded summary: placeholder bullet plus the normalizer's links.
pub fn degraded_summary(links: &[String]) -> Summary {
    Summary {
        bullets: [DEGRADED_SUMMARY.to_string(), String::new(), String::new()],
        category: Category::News.as_str().to_string(),
        links: links.to_vec(),
    }
}

/// Bullets rendered one per line, for prompts that take the summary.
pub fn summary_text(summary: &Summary) -> String {
    summary
        .bullets
        .iter()
        .filter(|b| !b.is_empty())
        .map(|b| format!("• {b}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Why an attempt against one provider did not yield a value.
#[derive(Debug)]
enum AttemptFailure {
    RateLimited,
    Unparseable,
    Error(LlmError),
}

impl AttemptFailure {
    fn label(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Unparseable => "unparseable",
            Self::Error(_) => "error",
        }
    }
}

pub struct InferenceGateway {
    primary: Arc<dyn LlmProvider>,
    secondary: Option<Arc<dyn LlmProvider>>,
    prompts: PromptSet,
    retry: RetryConfig,
}

impl InferenceGateway {
    pub fn new(
        primary: Arc<dyn LlmProvider>,
        secondary: Option<Arc<dyn LlmProvider>>,
        prompts: PromptSet,
        retry: RetryConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            prompts,
            retry,
        }
    }

    /// Run one inference of the given kind.
    pub async fn infer(&self, kind: InferenceKind, input: &InferenceInput<'_>) -> InferenceResult {
        match kind {
            InferenceKind::Summarize => {
                let (summary, source) = self.summarize(input).await;
                InferenceResult::Summary { summary, source }
            }
            InferenceKind::Classify => {
                let (category, source) = self.classify(input).await;
                InferenceResult::Category { category, source }
            }
            InferenceKind::Score => {
                let (score, source) = self.score(input).await;
                InferenceResult::Score { score, source }
            }
        }
    }

    pub async fn summarize(&self, input: &InferenceInput<'_>) -> (Summary, InferenceSource) {
        self.run(InferenceKind::Summarize, input, parse_summary)
            .await
            .unwrap_or_else(|| {
                (
                    degraded_summary(&input.content.links),
                    InferenceSource::Degraded,
                )
            })
    }

    pub async fn classify(&self, input: &InferenceInput<'_>) -> (Category, InferenceSource) {
        self.run(InferenceKind::Classify, input, parse_category)
            .await
            .unwrap_or((Category::News, InferenceSource::Degraded))
    }

    pub async fn score(&self, input: &InferenceInput<'_>) -> (u8, InferenceSource) {
        self.run(InferenceKind::Score, input, parse_score)
            .await
            .unwrap_or((DEGRADED_SCORE, InferenceSource::Degraded))
    }

    fn build_request(&self, kind: InferenceKind, input: &InferenceInput<'_>) -> CompletionRequest {
        let template = self.prompts.get(kind);
        let summary = input.summary.map(summary_text);
        let vars = PromptVars {
            subject: input.subject,
            sender: input.sender,
            content: &input.content.text,
            summary: summary.as_deref(),
        };
        CompletionRequest::new(vec![
            ChatMessage::system(template.system.clone()),
            ChatMessage::user(template.render(&vars)),
        ])
        .with_max_tokens(template.max_tokens)
        .with_temperature(template.temperature)
    }

    async fn run<T>(
        &self,
        kind: InferenceKind,
        input: &InferenceInput<'_>,
        parse: fn(&str) -> Option<T>,
    ) -> Option<(T, InferenceSource)> {
        let request = self.build_request(kind, input);

        let primary_failure = match self.attempt_primary(kind, &request, parse).await {
            Ok(value) => return Some((value, InferenceSource::Primary)),
            Err(failure) => failure,
        };

        let Some(secondary) = &self.secondary else {
            warn!(
                kind = %kind,
                reason = primary_failure.label(),
                source = "degraded",
                "Primary failed and no secondary is configured"
            );
            return None;
        };

        warn!(
            kind = %kind,
            primary = %self.primary.provider_name(),
            secondary = %secondary.provider_name(),
            reason = primary_failure.label(),
            "Falling back to secondary provider"
        );

        match self.attempt(secondary.as_ref(), kind, 1, &request, parse).await {
            Ok(value) => Some((value, InferenceSource::Fallback)),
            Err(failure) => {
                warn!(
                    kind = %kind,
                    reason = failure.label(),
                    source = "degraded",
                    "Both providers failed, using degraded result"
                );
                None
            }
        }
    }

    async fn attempt_primary<T>(
        &self,
        kind: InferenceKind,
        request: &CompletionRequest,
        parse: fn(&str) -> Option<T>,
    ) -> Result<T, AttemptFailure> {
        let mut retries = 0u32;
        loop {
            match self
                .attempt(self.primary.as_ref(), kind, retries + 1, request, parse)
                .await
            {
                Err(AttemptFailure::Error(e))
                    if e.is_transient() && retries < self.retry.max_retries =>
                {
                    retries += 1;
                    let delay = self.retry.backoff_for(retries);
                    warn!(
                        kind = %kind,
                        provider = %self.primary.provider_name(),
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// One request to one provider, parsed.
    async fn attempt<T>(
        &self,
        provider: &dyn LlmProvider,
        kind: InferenceKind,
        attempt: u32,
        request: &CompletionRequest,
        parse: fn(&str) -> Option<T>,
    ) -> Result<T, AttemptFailure> {
        let started = Instant::now();
        let response = match provider.complete(request.clone()).await {
            Ok(response) => response,
            Err(e) if e.is_rate_limited() => {
                warn!(
                    kind = %kind,
                    provider = %provider.provider_name(),
                    attempt,
                    error = %e,
                    "Provider rate limited"
                );
                return Err(AttemptFailure::RateLimited);
            }
            Err(e) => {
                debug!(
                    kind = %kind,
                    provider = %provider.provider_name(),
                    attempt,
                    error = %e,
                    "Provider call failed"
                );
                return Err(AttemptFailure::Error(e));
            }
        };

        let cost = costs::estimate(
            provider.cost_per_token(),
            response.input_tokens,
            response.output_tokens,
        );
        info!(
            kind = %kind,
            provider = %provider.provider_name(),
            model = %provider.model_name(),
            attempt,
            latency_ms = started.elapsed().as_millis() as u64,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost_usd = %cost,
            "Inference call complete"
        );

        parse(&response.content).ok_or_else(|| {
            warn!(
                kind = %kind,
                provider = %provider.provider_name(),
                raw_response = %response.content,
                "Unparseable response"
            );
            AttemptFailure::Unparseable
        })
    }
}
