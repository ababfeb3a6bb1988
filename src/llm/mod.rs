//! LLM integration for the newsletter pipeline.
//!
//! Supports:
//! - **Cerebras**: OpenAI-compatible endpoint, the default primary
//! - **OpenRouter**: OpenAI-compatible endpoint, the default secondary
//! - **Anthropic** / **OpenAI**: direct API access via rig-core
//!
//! OpenAI-compatible backends go through `OpenAiCompatProvider` so HTTP 429
//! is observed directly. rig-backed models are bridged by `RigAdapter`.

pub mod costs;
pub mod openai_compat;
pub mod provider;
pub mod retry;
mod rig_adapter;

pub use openai_compat::OpenAiCompatProvider;
pub use provider::*;
pub use retry::RetryConfig;
pub use rig_adapter::RigAdapter;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Cerebras,
    OpenRouter,
    /// Any other OpenAI-compatible endpoint; requires `LlmConfig::endpoint`.
    OpenAiCompat,
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cerebras => "cerebras",
            Self::OpenRouter => "openrouter",
            Self::OpenAiCompat => "openai-compat",
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cerebras" => Ok(Self::Cerebras),
            "openrouter" => Ok(Self::OpenRouter),
            "openai-compat" | "openai_compat" | "compat" => Ok(Self::OpenAiCompat),
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM backend '{other}'")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Endpoint override for OpenAI-compatible backends.
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Cerebras => Ok(create_compat_provider(config, openai_compat::CEREBRAS_ENDPOINT)),
        LlmBackend::OpenRouter => {
            Ok(create_compat_provider(config, openai_compat::OPENROUTER_ENDPOINT))
        }
        LlmBackend::OpenAiCompat => {
            let endpoint = config.endpoint.as_deref().ok_or_else(|| LlmError::RequestFailed {
                provider: config.backend.as_str().to_string(),
                reason: "openai-compat backend requires an endpoint".to_string(),
            })?;
            Ok(create_compat_provider(config, endpoint))
        }
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
    }
}

fn create_compat_provider(config: &LlmConfig, default_endpoint: &str) -> Arc<dyn LlmProvider> {
    let endpoint = config.endpoint.as_deref().unwrap_or(default_endpoint);
    tracing::info!(
        "Using {} (model: {}, endpoint: {})",
        config.backend.as_str(),
        config.model,
        endpoint
    );
    Arc::new(OpenAiCompatProvider::new(
        config.backend.as_str(),
        endpoint,
        config.model.clone(),
        config.api_key.clone(),
        config.timeout,
    ))
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "anthropic")))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "openai")))
}
