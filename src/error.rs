//! Error types for the newsletter digest pipeline.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors (knowledge base or local store).
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote store {store} rejected request: {reason}")]
    Remote { store: String, reason: String },
}

/// Mailbox channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to connect: {reason}")]
    ConnectFailed { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Channel {name} fetch failed: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Channel {name} could not mark message {id} processed: {reason}")]
    MarkFailed {
        name: String,
        id: String,
        reason: String,
    },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} rejected the request: {reason}")]
    InvalidRequest { provider: String, reason: String },

    #[error("Context length exceeded for {provider}: {reason}")]
    ContextLengthExceeded { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

impl LlmError {
    /// Whether the error is a quota/rate-limit signal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether retrying the same provider may succeed.
    ///
    /// Authentication and request-shape failures will not resolve on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { .. } | Self::InvalidResponse { .. } => true,
            Self::RateLimited { .. }
            | Self::InvalidRequest { .. }
            | Self::ContextLengthExceeded { .. }
            | Self::AuthFailed { .. } => false,
        }
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("All inference providers exhausted for {kinds}")]
    AllProvidersExhausted { kinds: String },

    #[error("Prompt template error: {0}")]
    Prompt(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
